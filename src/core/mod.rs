mod bins;
mod norm;
mod pixel;
mod reference;

pub use bins::{Bin, BinTable};
pub use norm::{MatrixType, Normalization, Unit};
pub use pixel::{Count, Pixel, ThinPixel};
pub use reference::{Chromosome, GenomicRange, Reference};
