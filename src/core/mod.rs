pub mod blur;
pub mod candidates;
pub mod color;
pub mod duplicate;
pub mod features;
pub mod hash;
pub mod mnn;
pub mod pipeline;
pub mod report;
pub mod scanner;
pub mod ssim;
