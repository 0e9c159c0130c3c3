// SPDX-License-Identifier: BlueOak-1.0.0

//! Architecture-specific geometry. Only ARMv7 is supported today, so
//! there is exactly one module here, but it stays separate from the
//! arch-independent BST/list logic so a second architecture could be
//! added without touching `shadow_pt`'s tree code.

pub mod armv7;

pub use armv7::*;
