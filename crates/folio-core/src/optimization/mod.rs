pub mod black_litterman;
pub mod efficient_frontier;
