//! # slimnet-core
//!
//! Layer graph, artifacts, device selection and quantized inference for SlimNet.
//!
//! ## Model Forms
//!
//! | Form | Artifact format | Struct |
//! |------|-----------------|--------|
//! | Full precision | `float` | [`Sequential`] |
//! | 8-bit weights and activations | `quantized` | [`QuantizedModel`] |
//!
//! Both implement [`Classifier`]; [`DeployedModel`] loads either from disk.
//!
//! ## Feature Flags
//!
//! | Flag | Effect |
//! |---|---|
//! | `cuda` | Enable CUDA GPU acceleration |
//! | `metal` | Enable Apple Metal GPU acceleration |

pub mod artifact;
pub mod device;
pub mod error;
pub mod layers;
pub mod loader;
pub mod model;
pub mod quantized;

pub use artifact::ArtifactFormat;
pub use device::{select_device, DeviceKind};
pub use error::{CoreError, CoreResult};
pub use layers::{BatchNormLayer, Conv2dLayer, Layer, LayerKind, LinearLayer, NamedLayer};
pub use loader::DeployedModel;
pub use model::{Classifier, Sequential};
pub use quantized::{QParams, QuantizedLayer, QuantizedModel, QuantizedOp, QuantizedWeight};
