pub mod profile;
pub mod recommendation;

pub use profile::*;
pub use recommendation::*;
pub use soil_test::*;
