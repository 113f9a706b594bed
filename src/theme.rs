//! Terminal styling for command output.

use dialoguer::console::{style, StyledObject};
use std::fmt::Display;

pub(crate) mod icons {
    pub const INFO: &str = "ℹ";
    pub const SUCCESS: &str = "✓";
    pub const WARNING: &str = "⚠";
    pub const ERROR: &str = "✗";
}

pub(crate) fn muted<D: Display>(value: D) -> StyledObject<D> {
    style(value).dim()
}

pub(crate) fn bold<D: Display>(value: D) -> StyledObject<D> {
    style(value).bold()
}

pub(crate) fn warning<D: Display>(value: D) -> StyledObject<D> {
    style(value).yellow()
}

pub(crate) fn error<D: Display>(value: D) -> StyledObject<D> {
    style(value).red()
}
