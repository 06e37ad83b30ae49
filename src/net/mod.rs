//! Network servers: HTTP/1.1 and TFTP, both dispatching onto the same
//! `Handler` pipeline abstraction, each owning its own ordered handler list.

pub mod http;
pub mod tftp;
