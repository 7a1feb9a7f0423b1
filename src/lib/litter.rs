//! Concrete litter profiles. Each names one hardware generation and
//! supplies the field tables the core is parameterised over.

mod g6;
mod g7;

pub use g6::G6;
pub use g7::G7;
