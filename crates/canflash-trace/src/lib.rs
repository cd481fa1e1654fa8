//! CAN frame interpretation and trace files
//!
//! Raw frames from a transport go through [`FrameInterpreter`], which decodes
//! them against the registered network descriptions, validates ECeS/ECoS
//! safety messages and writes every result to the open trace files.
//!
//! # Example
//!
//! ```ignore
//! use canflash_trace::{FrameInterpreter, TraceFormat};
//!
//! let interpreter = FrameInterpreter::new();
//! interpreter.load_database("system.toml", 0)?;
//! interpreter.add_log_file("logs/run1", Some(TraceFormat::Asc))?;
//! interpreter.start();
//! interpreter.handle_frame(frame);
//! ```

pub mod codec;
pub mod config;
pub mod error;
pub mod filter;
pub mod interpreted;
pub mod interpreter;
pub mod protocols;
pub mod safety;
pub mod sink;

pub use codec::{decode_signal, encode_raw, BitLayout, DecodedSignal, Scaling, SignalCodec, NOT_AVAILABLE};
pub use config::InterpreterConfig;
pub use error::{TraceError, TraceResult};
pub use filter::{FilterMode, FilterRule, MessageFilter};
pub use interpreted::{InterpretedFrame, InterpretedSignal};
pub use interpreter::{BusMetadata, FrameInterpreter};
pub use protocols::RawProtocol;
pub use safety::SafetyMessageTracker;
pub use sink::{TraceFormat, TraceOptions, TraceSink, TraceWriter};
