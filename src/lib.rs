//! Matter controller read sessions and group key administration
//!
//! Library drives attribute and event reads against commissioned Matter nodes and manages
//! fabric scoped group keys. Asynchronous parts run on Tokio.
//! Following are main parts of api:
//! - [ReadController](read::ReadController) - starts read interaction against node. Uses
//!                             [DeviceConnectionService](connection::DeviceConnectionService) to get secure session
//!                             and [InteractionEngine](im::InteractionEngine) to send request. Received items are
//!                             delivered to [ReadCallbacks](read::ReadCallbacks).
//! - [MessageInteractionEngine](im::MessageInteractionEngine) - interaction engine running read exchange
//!                             (including chunked reports) over any [ReadTransport](im::ReadTransport).
//! - [ResolvingConnectionService](connection::ResolvingConnectionService) - connection service using async
//!                             [SessionResolver](connection::SessionResolver).
//! - [GroupSettings](groups::GroupSettings) - administration of groups, keysets and group to keyset bindings
//!                             stored in [GroupDataProvider](groups::GroupDataProvider).
//!                             [StoreGroupDataProvider](groups::StoreGroupDataProvider) keeps them in memory or in json file.
//! - [tlv](tlv) - Module with simple matter tlv encoders and decoders.
//!
//! Example how to add group protected by new keyset:
//! ```no_run
//! # use anyhow::Result;
//! # use matc_groups::{config, groups};
//! # fn main() -> Result<()> {
//! let cfg = config::load_config("./groupctl")?;
//! let provider = groups::StoreGroupDataProvider::load(&cfg.group_store)?;
//! let settings = groups::GroupSettings::new(provider, &cfg.fabric()?)?;
//! settings.add_keyset(0x0005, 0, 0, "hex:d0d1d2d3d4d5d6d7d8d9dadbdcdddedf")?;
//! settings.add_group("kitchen", 0x0101)?;
//! settings.bind_keyset(0x0101, 0x0005)?;
//! println!("{}", settings.show_groups());
//! # Ok(())
//! # }
//! ```
//!
//! Example reading on/off attribute:
//! ```no_run
//! # use std::sync::Arc;
//! # use matc_groups::{connection, im, read};
//! # async fn example<R: connection::SessionResolver, T: im::ReadTransport>(resolver: R, transport: Arc<T>) -> matc_groups::error::Result<()> {
//! let controller = read::ReadController::new(
//!     connection::ResolvingConnectionService::new(resolver),
//!     im::MessageInteractionEngine::new(transport),
//! );
//! let callbacks = read::ReadCallbacks {
//!     attribute_data: Some(Box::new(|node, path, data| println!("0x{:x} {} {:?}", node, path, data.value))),
//!     done: Some(Box::new(|node, _, _| println!("read from 0x{:x} done", node))),
//!     ..Default::default()
//! };
//! read::send_read_attr_command(&controller, 0x1234, &[1], &[0x0006], &[0x0000], callbacks)?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod connection;
pub mod error;
pub mod fabric;
pub mod groups;
pub mod im;
pub mod messages;
pub mod read;
pub mod tlv;
