pub mod sas;
pub mod url_encoder;
