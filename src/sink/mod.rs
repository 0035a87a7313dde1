pub mod cloudwatch;
pub mod credentials;
pub mod imds;
pub mod sigv4;
pub mod traits;
pub mod writer;

pub use cloudwatch::CloudWatchLogsClient;
pub use credentials::{Credentials, CredentialsError, CredentialsProvider, InstanceRoleProvider};
pub use imds::{IdentityDocument, InstanceMetadata, MetadataError, RoleCredentials};
pub use traits::{FailureKind, InputLogEvent, LogSink, LogTarget, PutOutcome, SinkError};
pub use writer::{Writer, WriterError};
