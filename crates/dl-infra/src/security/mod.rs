mod tpm;

pub use tpm::TpmProbe;
