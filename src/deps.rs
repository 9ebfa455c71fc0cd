//! The dependency resolver: transitive DT_NEEDED closure.
//!
//! For every needed name: apply the namespace's library remap table, reuse
//! a file already loaded under that name, otherwise search the disk and
//! reuse by (device, inode) before mapping anything new. Search order is
//! DT_RUNPATH (of the requester) or else the DT_RPATHs of the requester
//! and its ancestors, then LD_LIBRARY_PATH, then the system directories,
//! and finally the verbatim name when it contains a slash.

use crate::engine::Rtld;
use crate::error::dependency_error;
use crate::file::ImageId;
use crate::map;
use crate::mmap::Mmap;
use crate::os;
use crate::Result;
use alloc::ffi::CString;
use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;
use core::ffi::CStr;

/// Expand one search-path string into directories: colon separated, empty
/// component means `.`, `$LIB` expands to the architecture's library
/// directory name.
fn split_search_path(spec: &str, out: &mut Vec<String>) {
    for component in spec.split(':') {
        if component.is_empty() {
            out.push(String::from("."));
        } else if component.contains("$LIB") {
            out.push(component.replace("$LIB", crate::arch::LIB_DIR));
        } else {
            out.push(String::from(component));
        }
    }
}

/// Find `name` on disk, honoring the search order. Returns the path the
/// file was found under.
pub(crate) fn search_file(
    rtld: &Rtld,
    name: &CStr,
    runpath: Option<&str>,
    rpaths: &[String],
) -> Option<CString> {
    let name_str = core::str::from_utf8(name.to_bytes()).ok()?;

    let mut dirs: Vec<String> = Vec::new();
    // RUNPATH, if the requester has one, replaces the RPATH chain.
    if let Some(runpath) = runpath {
        split_search_path(runpath, &mut dirs);
    } else {
        for rpath in rpaths {
            split_search_path(rpath, &mut dirs);
        }
    }
    if let Some(ld_path) = &rtld.ld_library_path {
        if let Ok(spec) = core::str::from_utf8(ld_path.to_bytes()) {
            split_search_path(spec, &mut dirs);
        }
    }
    for dir in crate::arch::SYSTEM_SEARCH_DIRS {
        dirs.push(String::from(*dir));
    }

    for dir in &dirs {
        let candidate = format!("{}/{}", dir, name_str);
        if let Ok(path) = CString::new(candidate) {
            if os::RawFile::exists(&path) {
                return Some(path);
            }
        }
    }
    // a name with a slash may also be used verbatim
    if name_str.contains('/') {
        if os::RawFile::exists(name) {
            return Some(name.into());
        }
    }
    None
}

/// Resolve the full DT_NEEDED closure under `root`. Every file mapped
/// along the way is appended to `newly_mapped` so a failing caller can
/// roll the subtree back.
pub(crate) fn resolve_deps<M: Mmap>(
    rtld: &mut Rtld,
    root: ImageId,
    newly_mapped: &mut Vec<ImageId>,
) -> Result<()> {
    let mut rpath_chain: Vec<String> = Vec::new();
    resolve_recursive::<M>(rtld, root, &mut rpath_chain, newly_mapped)
}

fn resolve_recursive<M: Mmap>(
    rtld: &mut Rtld,
    id: ImageId,
    rpath_chain: &mut Vec<String>,
    newly_mapped: &mut Vec<ImageId>,
) -> Result<()> {
    if rtld.file(id).deps_resolved {
        return Ok(());
    }
    // set before recursing so dependency cycles terminate
    rtld.file_mut(id).deps_resolved = true;

    let context = rtld.file(id).context;
    let needed = rtld.file(id).needed();
    let runpath = rtld.file(id).runpath();
    let parent_depth = rtld.file(id).depth;
    if let Some(rpath) = rtld.file(id).rpath() {
        rpath_chain.push(String::from(rpath));
    }

    for name in needed {
        // the namespace may redirect the name altogether
        let name: CString = {
            let ns = rtld.context(context);
            ns.remap_lib(name).into()
        };

        let dep = if let Some(existing) = rtld.find_by_name(context, &name) {
            existing
        } else {
            let path = search_file(rtld, &name, runpath, rpath_chain).ok_or_else(|| {
                dependency_error(format!(
                    "{}: needed by {}",
                    name.to_str().unwrap_or("<non-utf8>"),
                    rtld.file(id).name_str()
                ))
            })?;
            // the same file may already be loaded under another name
            let by_inode = os::stat_dev_ino(&path)
                .and_then(|(dev, ino)| rtld.find_by_dev_ino(context, dev, ino));
            match by_inode {
                Some(existing) => existing,
                None => {
                    let new_id = map::map_single::<M>(rtld, context, &path, &name)?;
                    newly_mapped.push(new_id);
                    new_id
                }
            }
        };

        let dep_file = rtld.file_mut(dep);
        dep_file.depth = dep_file.depth.max(parent_depth + 1);
        if !rtld.file(id).deps.contains(&dep) {
            rtld.file_mut(id).deps.push(dep);
        }
        resolve_recursive::<M>(rtld, dep, rpath_chain, newly_mapped)?;
    }

    if rtld.file(id).rpath().is_some() {
        rpath_chain.pop();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn search_path_expansion() {
        let mut dirs = Vec::new();
        split_search_path("/opt/lib::/usr/$LIB", &mut dirs);
        assert_eq!(dirs[0], "/opt/lib");
        assert_eq!(dirs[1], ".");
        assert_eq!(dirs[2], format!("/usr/{}", crate::arch::LIB_DIR));
    }
}
