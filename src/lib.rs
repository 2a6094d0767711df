mod tooling;

pub use tooling::*;
