pub mod entities;
pub mod errors;
pub mod services;

#[cfg(test)]
mod concurrency_tests;
