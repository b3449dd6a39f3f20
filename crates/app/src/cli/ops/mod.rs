pub mod collections;
pub mod init;
pub mod migrate;
pub mod status;
pub mod version;

pub use collections::Collections;
pub use init::Init;
pub use migrate::Migrate;
pub use status::Status;
pub use version::Version;

use clap::Args;
use common::migrate::RootSelector;

/// Which part of the source to migrate. Defaults to the whole tree.
#[derive(Args, Debug, Clone, Default)]
pub struct RootArgs {
    /// Migrate a shared collection by name
    #[arg(long, conflicts_with = "shared_with_me")]
    pub collection: Option<String>,

    /// Migrate the items other people shared with the source account
    #[arg(long)]
    pub shared_with_me: bool,
}

impl RootArgs {
    pub fn selector(&self) -> RootSelector {
        match (&self.collection, self.shared_with_me) {
            (Some(name), _) => RootSelector::Collection(name.clone()),
            (None, true) => RootSelector::SharedWithMe,
            (None, false) => RootSelector::MyTree,
        }
    }
}
