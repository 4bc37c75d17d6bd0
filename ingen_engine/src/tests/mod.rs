mod compile_tests;
mod engine_tests;
mod internal_tests;
mod utils;
