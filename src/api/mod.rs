//! Wire-facing modules: message contracts, the region-server-facing hub,
//! the admin-facing reactor, and the admin client stub.

mod adminstub;
mod messages;
mod reactor;
mod rshub;

pub use adminstub::AdminClient;
pub use messages::{
    AdminReply, AdminRequest, ClusterStatus, ConfigSubset, Directive, RsMsg,
    RsReply, RsRequest, TableAction,
};
pub use reactor::{AdminReactor, ClientId};
pub use rshub::{RegionServerHub, RegionServerStub};
