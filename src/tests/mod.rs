
#[cfg(test)]
pub mod iteration_tests;
