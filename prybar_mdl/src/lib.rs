#![warn(clippy::all, clippy::pedantic, clippy::multiple_crate_versions)]
#![allow(
    clippy::module_name_repetitions,
    clippy::cast_possible_truncation,
    clippy::cast_possible_wrap,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]

mod binary_utils;
pub mod mdl;

use std::{
    fmt::{self, Display},
    io, result,
};

use thiserror::Error;

pub use mdl::{
    anim::{
        ani_path_candidates, resolve_ani_path, section_for_frame, AnimationDecoder,
        AnimationSection, Ani, DecodedPose,
    },
    AnimationDesc, AnimationDescFlags, Bone, HeaderFlags, Mdl, Model, Movement,
};

#[derive(Debug, Clone, Error, Hash, PartialEq, Eq)]
pub enum Error {
    #[error("io error reading `{path}`: {error}")]
    Io { path: String, error: String },
    #[error("not a {ty} file: invalid signature `{signature}`")]
    InvalidSignature { ty: FileType, signature: String },
    #[error("unsupported {ty} version {version}")]
    UnsupportedVersion { ty: FileType, version: i32 },
    #[error("{ty} corrupted: {error}")]
    Corrupted { ty: FileType, error: &'static str },
}

#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq)]
pub enum FileType {
    Mdl,
    Ani,
}

pub type Result<T> = result::Result<T, Error>;

impl Display for FileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FileType::Mdl => "mdl",
            FileType::Ani => "ani",
        })
    }
}

impl Error {
    fn from_io(err: &io::Error, path: &impl ToString) -> Self {
        Self::Io {
            path: path.to_string(),
            error: err.to_string(),
        }
    }
}
