pub mod bochs_vga;
pub mod ram;

pub use bochs_vga::{BochsVga, BochsVgaConfig};
pub use ram::SystemRam;
