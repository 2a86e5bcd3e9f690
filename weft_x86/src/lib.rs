//! weft_x86: x86 and x86-64 instruction decoder and encoder.

pub mod build;
pub mod decode;
pub mod display;
pub mod encode;
pub mod inst;
pub mod reg;

pub use decode::{decode_all, decode_one, refine_relocations, Decoder, Unrecognized};
pub use encode::{encode, EncodeError, Encoded};
pub use inst::{Base, Inst, Mem, Op, OpSize, Operand, Reg};
pub use reg::{Cond, Gpr};

#[cfg(test)]
mod tests;
