pub mod covariance;
pub mod frontier;
pub mod mean_variance;
pub mod solver;
pub mod statistics;
