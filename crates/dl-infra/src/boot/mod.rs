mod fs_boot;

pub use fs_boot::FsBoot;
