mod assertion_db;
mod device_service;
mod keypair;

pub use assertion_db::FsAssertionDb;
pub use device_service::HttpDeviceService;
pub use keypair::FsKeyPairStore;
