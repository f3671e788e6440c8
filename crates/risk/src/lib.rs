pub mod costs;
pub mod sizing;

pub use costs::CostProfile;
pub use sizing::{position_size, RiskCapitalBasis, Size, SizingError};
