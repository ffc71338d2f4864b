pub mod channel;
pub mod config;
pub mod consts;
pub mod controller;
pub mod dispatch;
pub mod error;
pub mod message;
pub mod registry;
pub mod role;
pub mod switch;
mod utils;

pub use channel::{AcceptorConfig, ChannelDeps};
pub use config::Config;
pub use controller::Controller;
pub use dispatch::{Command, HaListener, ListenerContext, MessageDispatcher, MessageListener, Update};
pub use error::Error;
pub use message::{BuiltinCodec, OfHeader, OfMessage, WireCodec};
pub use registry::{ClusterSwitchView, NullClusterView, SwitchRegistry};
pub use role::{RoleChanger, RoleInfo, RoleManager};
pub use switch::{Dpid, Switch, SwitchHandle};
