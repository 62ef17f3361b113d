//! Output filename convention.
//!
//! The server names every artifact `<filename_prefix>_<counter>_.png`. The
//! prefix carries the job sequence number, which is how artifacts found on
//! disk are mapped back to their job.

use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;

use crate::types::JobSeq;

/// Extensions treated as generated images.
pub const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "webp"];

static JOB_SEQ_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"-job(\d+)_").expect("valid regex"));

/// `<type>/<checkpoint>/<checkpoint>-<run tag>-job<seq>`.
pub fn filename_prefix(checkpoint_type: &str, checkpoint: &str, run_tag: &str, seq: JobSeq) -> String {
    format!("{checkpoint_type}/{checkpoint}/{checkpoint}-{run_tag}-job{seq:06}")
}

/// Whether `path` has an image extension.
pub fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| IMAGE_EXTENSIONS.iter().any(|x| x.eq_ignore_ascii_case(e)))
}

/// Extract the job sequence number from an artifact path.
///
/// Only image files are considered; the run tag must match when given so
/// artifacts from earlier runs in the same directory are ignored.
pub fn parse_job_seq(path: &Path, run_tag: Option<&str>) -> Option<JobSeq> {
    if !is_image(path) {
        return None;
    }
    let name = path.file_name()?.to_str()?;
    if let Some(tag) = run_tag {
        if !name.contains(&format!("-{tag}-job")) {
            return None;
        }
    }
    JOB_SEQ_RE
        .captures_iter(name)
        .last()
        .and_then(|caps| caps[1].parse().ok())
}
