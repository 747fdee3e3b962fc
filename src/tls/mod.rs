pub mod authority;

pub use authority::CertificateAuthority;
