//! Progress bars for dataset sweeps.

use indicatif::{ProgressBar, ProgressStyle};

use crate::error::Result;

/// Bar in the style used by every sweep; hidden when stderr is not a terminal.
pub(crate) fn sweep_bar(len: usize, prefix: &'static str) -> Result<ProgressBar> {
    let pb = ProgressBar::new(len as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{prefix:>10} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos:>7}/{len:7} {msg}")?
            .progress_chars("#>-"),
    );
    pb.set_prefix(prefix);
    Ok(pb)
}
