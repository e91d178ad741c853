//! Driver and student controllers. They own the components and turn user input,
//! store snapshots and geolocation samples into component calls.

pub mod driver;
pub mod student;

pub use driver::{DriverDashboard, DriverEvent};
pub use student::{StudentDashboard, StudentEvent};
