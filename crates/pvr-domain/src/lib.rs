#![deny(clippy::all)]
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::must_use_candidate
)]

pub mod image;
pub mod package;
pub mod protocol;
pub mod registry;
pub mod state;

pub use image::{ImageMeta, PixelFormat};
pub use package::{parse_channel, Manifest, PackageKey, PythonRequirement};
pub use protocol::{
    CallPayload, CallRequest, CallResponse, CallResult, ChildMessage, DefectRect, HostMessage,
    ResponseOutcome, ResponseStatus, ResultData, Verdict, MAX_DEFECT_RECTS,
};
pub use registry::{
    ActiveMapping, EnvironmentRecord, EnvironmentStatus, InterpreterSource, PackageState,
    RegistryEntry,
};
pub use state::{ProcessEvent, ProcessState};
