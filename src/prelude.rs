// SPDX-License-Identifier: MIT OR Apache-2.0

//! Re-exports of the types most callers need, so `use modbus_rt::prelude::*;`
//! is enough for typical client or server code.

pub use crate::client::ClientHandle;
pub use crate::coil::CoilData;
pub use crate::error::{Error, ErrorCode, Result};
pub use crate::message::{Message, RegisterOrder, Request, Response};
pub use crate::slave::{Slave, SlaveId};
pub use crate::target::Target;

#[cfg(feature = "rtu")]
pub use crate::rtu::{DirectionControl, NoDirectionControl, RtuFramer, RtuPort};

#[cfg(feature = "tcp")]
pub use crate::tcp::TcpConnection;

#[cfg(feature = "server")]
pub use crate::server::{fn_handler, Dispatcher, Handler, ServerRequest};
