pub mod handler;
pub mod middleware;
#[cfg(test)]
mod tests;
pub use handler::router;
