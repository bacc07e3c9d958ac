
mod engine_tests;
mod iterator_tests;
mod table_tests;
