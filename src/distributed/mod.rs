pub mod collective;
pub mod partition;
pub mod process;

pub use collective::{Communicator, communicators};
pub use partition::{Shard, partition, split_between_processes, truncate_gathered};
pub use process::{ProcessState, launch};
