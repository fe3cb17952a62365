pub mod directory;

pub use directory::{
    DirectoryClient, DirectoryError, FetchedMessage, GraphAuth, GraphAuthError, GraphConfig,
    GraphDirectory, ReplyMessage, RetryPolicy, RetryingDirectory,
};
