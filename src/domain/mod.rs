pub mod series;
pub mod shift_window;
pub mod transfer;

pub use series::*;
pub use shift_window::*;
pub use transfer::*;
