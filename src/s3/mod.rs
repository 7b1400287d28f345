pub mod client;
pub mod error;
pub mod signer;
pub mod target;
pub mod upload;

pub use client::{GetObjectOutput, ObjectBody, ObjectStat, S3Client};
pub use error::{Result, S3Error};
pub use signer::{AnonymousSigner, Credentials, RequestSigner, SigV4Signer};
pub use target::{ObjectUrl, Target};
pub use upload::{UploadHandle, file_md5, upload_file};
