//! The swap-type decision table.
//!
//! A fixed ordered table over the two slots' trailer states. Rows are
//! consulted top to bottom and the first full match wins; secondary-slot
//! requests outrank primary-slot state, which is why the TEST/PERM rows
//! precede the REVERT row.

use super::trailer::{FlagState, MagicState, SwapState, SwapType};

#[derive(Copy, Clone, PartialEq, Eq)]
enum MagicCheck {
    Any,
    Good,
    Unset,
}

#[derive(Copy, Clone, PartialEq, Eq)]
enum FlagCheck {
    Any,
    Set,
    Unset,
}

struct Row {
    magic_primary: MagicCheck,
    magic_secondary: MagicCheck,
    image_ok_primary: FlagCheck,
    image_ok_secondary: FlagCheck,
    copy_done_primary: FlagCheck,
    swap_type: SwapType,
}

static TABLE: [Row; 3] = [
    Row {
        magic_primary: MagicCheck::Any,
        magic_secondary: MagicCheck::Good,
        image_ok_primary: FlagCheck::Any,
        image_ok_secondary: FlagCheck::Unset,
        copy_done_primary: FlagCheck::Any,
        swap_type: SwapType::Test,
    },
    Row {
        magic_primary: MagicCheck::Any,
        magic_secondary: MagicCheck::Good,
        image_ok_primary: FlagCheck::Any,
        image_ok_secondary: FlagCheck::Set,
        copy_done_primary: FlagCheck::Any,
        swap_type: SwapType::Perm,
    },
    Row {
        magic_primary: MagicCheck::Good,
        magic_secondary: MagicCheck::Unset,
        image_ok_primary: FlagCheck::Unset,
        image_ok_secondary: FlagCheck::Any,
        copy_done_primary: FlagCheck::Set,
        swap_type: SwapType::Revert,
    },
];

fn magic_matches(check: MagicCheck, value: MagicState) -> bool {
    match check {
        MagicCheck::Any => true,
        MagicCheck::Good => value == MagicState::Good,
        MagicCheck::Unset => value == MagicState::Unset,
    }
}

fn flag_matches(check: FlagCheck, value: FlagState) -> bool {
    match check {
        FlagCheck::Any => true,
        FlagCheck::Set => value == FlagState::Set,
        FlagCheck::Unset => value == FlagState::Unset,
    }
}

/// Maps the two trailers to the action the bootloader should take. States
/// not named by any row need no action.
pub fn swap_type(primary: &SwapState, secondary: &SwapState) -> SwapType {
    for row in &TABLE {
        if magic_matches(row.magic_primary, primary.magic)
            && magic_matches(row.magic_secondary, secondary.magic)
            && flag_matches(row.image_ok_primary, primary.image_ok)
            && flag_matches(row.image_ok_secondary, secondary.image_ok)
            && flag_matches(row.copy_done_primary, primary.copy_done)
        {
            if !row.swap_type.is_upgrade() {
                return SwapType::Panic;
            }
            info!("swap decision: type {=u8}", row.swap_type.to_nibble());
            return row.swap_type;
        }
    }
    SwapType::None
}
