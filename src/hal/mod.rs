//! Hardware abstraction boundary.
//!
//! The engine talks to hardware through three traits:
//!
//! - [`BufferAuthority`] - Supplies and takes back every buffer
//! - [`StageDriver`] - Runs one lane's stages and reports completion
//! - [`PacingSource`] - Signals that the hardware can take the next frame
//!
//! With the `sim-hardware` feature, [`sim`] provides implementations of all
//! three that run entirely in memory.

pub mod buffer;
pub mod driver;
pub mod pacing;
#[cfg(feature = "sim-hardware")]
pub mod sim;

pub use buffer::{Buffer, BufferAuthority, BufferId, BufferStatus, BufferTag};
pub use driver::{CompletionSink, Rejected, StageDriver};
pub use pacing::{Pacing, PacingSource};

use crate::pipeline::id::StageId;
use std::collections::HashMap;
use std::sync::Arc;

/// Hardware handed to a session when it is opened.
pub struct Hardware {
    pub buffers: Arc<dyn BufferAuthority>,
    /// Driver per lane leader.
    pub drivers: HashMap<StageId, Arc<dyn StageDriver>>,
    pub pacing: Arc<dyn PacingSource>,
}
