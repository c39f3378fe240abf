//! Gadget node discovery: scan `/dev/video*` for the first output-capable
//! node that is not on the ignore list.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::debug;
use v4l::capability::Flags;

/// Find the first V4L2 node advertising video output.
///
/// `ignored_nodes` holds full paths (e.g. `/dev/video3`) the caller knows
/// are not the gadget, such as codec or capture nodes.
pub fn find_output_node(ignored_nodes: &HashSet<String>) -> Option<PathBuf> {
    let mut nodes: Vec<PathBuf> = v4l::context::enum_devices()
        .iter()
        .map(|node| node.path().to_path_buf())
        .collect();
    nodes.sort();
    for path in nodes {
        let path_display = path.display().to_string();
        if ignored_nodes.contains(&path_display) {
            debug!("skipping ignored node {path_display}");
            continue;
        }
        if is_output_node(&path) {
            debug!("{path_display} supports video output");
            return Some(path);
        }
    }
    None
}

fn is_output_node(path: &Path) -> bool {
    let Ok(dev) = v4l::Device::with_path(path) else {
        debug!("could not open {} while scanning", path.display());
        return false;
    };
    match dev.query_caps() {
        Ok(caps) => caps.capabilities.contains(Flags::VIDEO_OUTPUT),
        Err(err) => {
            debug!("querycap on {} failed: {err}", path.display());
            false
        }
    }
}
