pub mod directory;
pub mod multicast;

pub use directory::DirectoryClient;
pub use multicast::MulticastDiscovery;
