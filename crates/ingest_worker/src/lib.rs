pub mod auction;
pub mod batch_queue;
pub mod dispatch;
pub mod ingest_worker;
pub mod ingress;
pub mod pool;
pub mod reassembly;

pub use auction::*;
pub use batch_queue::*;
pub use dispatch::*;
pub use ingest_worker::*;
pub use ingress::*;
pub use pool::*;
pub use reassembly::*;
