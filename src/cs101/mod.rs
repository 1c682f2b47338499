//! IEC 60870-5-101: the serial profile.

pub mod balanced;
pub mod frame;
pub mod link;
pub mod slave;
pub mod unbalanced;

pub use balanced::Iec101MasterBalanced;
pub use frame::{Decoded, FrameReader, Ft12Frame};
pub use link::{LinkChannel, LinkControl, PrimaryFunction, SecondaryFunction};
pub use slave::{Iec101Slave, Iec101SlaveConfig, SlaveStatus};
pub use unbalanced::{Iec101MasterConfig, Iec101MasterUnbalanced, MasterStatus};
