pub mod convergence;
pub mod lifecycle;
pub mod platforms;
