// See <https://matklad.github.io/2021/02/27/delete-cargo-integration-tests.html>

pub mod read_through;
pub mod repository;
pub mod utils;

pub use utils::*;
