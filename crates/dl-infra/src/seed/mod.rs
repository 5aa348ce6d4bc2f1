mod fs_seed;

pub use fs_seed::FsSeed;
