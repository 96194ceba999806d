//! Firmware upload.
//!
//! Flashing is entirely recipe-driven: the selected programmer bundle
//! defines an `upload.<name>.script` key family that the interpreter
//! executes after a successful build, with `${port}`, `${port.base}` and
//! `${verbose}` expanding against the current context. Port locking and
//! similar host concerns are builtin-registry collaborators, not engine
//! code.

use crate::build::Pipeline;
use crate::builtin::BuiltinRegistry;
use crate::context::Context;
use crate::libs::LibraryCatalog;
use crate::script;
use crate::sketch::Sketch;
use anyhow::Result;

pub fn upload(
    ctx: &mut Context,
    builtins: &BuiltinRegistry,
    catalog: &LibraryCatalog,
    sketch: &mut Sketch,
) -> Result<bool> {
    if !Pipeline::new(ctx, catalog, sketch).build()? {
        return Ok(false);
    }

    let Some(programmer) = ctx.programmer.as_ref().map(|p| p.name.clone()) else {
        ctx.error("You have no programmer selected. You must select a programmer before you can upload.");
        return Ok(false);
    };

    let key = format!("upload.{}.script", programmer);
    let props = ctx.merged();
    if !script::has_script(&props, &key) && !props.key_exists(&key) {
        ctx.error(&format!("Programmer {} defines no upload script.", programmer));
        return Ok(false);
    }

    ctx.message("Uploading firmware...");
    let ok = script::execute_key(ctx, builtins, &key, false)?;
    if ok {
        ctx.message("Upload complete.");
    } else if !ctx.aborted() {
        ctx.error("Upload failed.");
    }
    Ok(ok)
}
