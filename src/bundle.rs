//! Bundling: inlining external `$ref` targets into the root's `$defs`.
//!
//! Three passes, all walking the tree through [`Schema::subschemas`]:
//!
//! - [`bundle_schema`] loads every externally referenced document and adds
//!   it to `root.$defs`, keeping the `$ref`s as they are. Each document is
//!   keyed by its canonical id, which also makes reference cycles terminate.
//! - [`bundle_remove_ids`] rewrites external `$ref`s into local `#/$defs/...`
//!   pointers and drops the `$id`s of bundled definitions, for tools that do
//!   not understand `$id`.
//! - [`remove_unused_defs`] prunes definitions nothing refers to.

use std::collections::HashMap;

use crate::error::BundleError;
use crate::keyword::{Keyword, SlotMut};
use crate::loader::{LoadContext, Loader};
use crate::ptr::Ptr;
use crate::referrer::{is_local_ref, split_fragment, Referrer};
use crate::schema::{Schema, SchemaMap};

/// An external `$ref` waiting to be bundled.
struct PendingRef {
    ptr: Ptr,
    reference: String,
    referrer: Referrer,
    holder_id: String,
}

/// Load every document `root` references, directly or through other loaded
/// documents, into `root.$defs`.
///
/// Children are handled before their parent, and map keywords in sorted key
/// order, so the generated definition names are stable across runs. A
/// document whose id is already in `root.$defs` is not loaded again;
/// bundling an already bundled schema is a no-op.
///
/// # Errors
///
/// Fails on the first reference that cannot be resolved or loaded, naming
/// the location of the `$ref` in the tree.
pub fn bundle_schema(
    ctx: &LoadContext,
    loader: &dyn Loader,
    root: &mut Schema,
) -> Result<(), BundleError> {
    let mut pending = Vec::new();
    collect_external_refs(&Ptr::new(), root, &mut pending);
    bundle_pending(ctx, loader, root, pending)
}

fn collect_external_refs(ptr: &Ptr, schema: &Schema, out: &mut Vec<PendingRef>) {
    for (rel, child) in schema.subschemas() {
        collect_external_refs(&ptr.add([&rel]), child, out);
    }
    if schema.r#ref.is_empty() || is_local_ref(&schema.r#ref) {
        return;
    }
    out.push(PendingRef {
        ptr: ptr.clone(),
        reference: schema.r#ref.clone(),
        referrer: schema.ref_referrer.clone(),
        holder_id: schema.id.clone(),
    });
}

fn bundle_pending(
    ctx: &LoadContext,
    loader: &dyn Loader,
    root: &mut Schema,
    pending: Vec<PendingRef>,
) -> Result<(), BundleError> {
    for item in pending {
        let id = item
            .referrer
            .resolve(&item.reference)
            .map_err(|source| BundleError::InvalidReference {
                ptr: item.ptr.clone(),
                reference: item.reference.clone(),
                source,
            })?;
        if find_def(&root.defs, &id).is_some() {
            continue;
        }

        let load_ctx = if item.holder_id.is_empty() {
            ctx.clone()
        } else {
            ctx.clone().with_referrer(item.holder_id.clone())
        };
        tracing::debug!(ptr = %item.ptr, id = %id, "bundling reference");
        let loaded = loader
            .load(&load_ctx, &id)
            .map_err(|source| BundleError::Load {
                ptr: item.ptr.clone(),
                source,
            })?;

        let mut document = Schema::clone(&loaded);
        document.id = id.clone();
        let referrer = Referrer::for_document(&id);
        document.set_referrer(&referrer);

        let hoisted = take_identified_defs(&mut document, &referrer).map_err(
            |(reference, source)| BundleError::InvalidReference {
                ptr: item.ptr.clone(),
                reference,
                source,
            },
        )?;
        let hoisted: Vec<String> = hoisted
            .into_iter()
            .filter_map(|def| insert_def(&mut root.defs, def))
            .collect();
        let name = insert_def(&mut root.defs, document);

        for name in name.into_iter().chain(hoisted) {
            bundle_def(ctx, loader, root, &name)?;
        }
    }
    Ok(())
}

fn bundle_def(
    ctx: &LoadContext,
    loader: &dyn Loader,
    root: &mut Schema,
    name: &str,
) -> Result<(), BundleError> {
    let mut pending = Vec::new();
    if let Some(def) = root.defs.get(name) {
        let ptr = Ptr::from_tokens([Keyword::Defs.as_str(), name]);
        collect_external_refs(&ptr, def, &mut pending);
    }
    bundle_pending(ctx, loader, root, pending)
}

/// Move `$defs`/`definitions` entries carrying their own `$id` out of
/// `document`, resolving those ids against the document.
fn take_identified_defs(
    document: &mut Schema,
    referrer: &Referrer,
) -> Result<Vec<Schema>, (String, url::ParseError)> {
    let mut taken = Vec::new();
    for map in [&mut document.defs, &mut document.definitions] {
        let names: Vec<String> = map
            .iter()
            .filter(|(_, def)| !def.is_bool() && !def.id.is_empty())
            .map(|(name, _)| name.clone())
            .collect();
        for name in names {
            let Some(mut def) = map.remove(&name) else {
                continue;
            };
            def.id = referrer
                .resolve(&def.id)
                .map_err(|source| (def.id.clone(), source))?;
            def.set_referrer(&Referrer::for_document(&def.id));
            taken.push(def);
        }
    }
    Ok(taken)
}

/// Name of the definition in `defs` whose `$id` is `id`.
fn find_def<'a>(defs: &'a SchemaMap, id: &str) -> Option<&'a str> {
    defs.iter()
        .find(|(_, def)| !def.id.is_empty() && split_fragment(&def.id).0 == id)
        .map(|(name, _)| name.as_str())
}

/// Insert `def` under a name derived from its id. Returns the new name, or
/// `None` if a definition with the same id was already present.
fn insert_def(defs: &mut SchemaMap, def: Schema) -> Option<String> {
    if find_def(defs, &def.id).is_some() {
        return None;
    }
    let base = def_base_name(&def.id);
    let mut name = base.clone();
    let mut n = 1;
    while defs.contains_key(&name) {
        n += 1;
        name = format!("{base}_{n}");
    }
    tracing::debug!(name = %name, id = %def.id, "adding bundled definition");
    defs.insert(name.clone(), def);
    Some(name)
}

/// Last path segment of an id: `https://example.com/a/foo.json` → `foo.json`.
fn def_base_name(id: &str) -> String {
    let (location, _) = split_fragment(id);
    let location = location.split('?').next().unwrap_or(location);
    location
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|segment| !segment.is_empty())
        .unwrap_or("schema")
        .to_string()
}

/// Ids of the root's bundled definitions, mapped to their names.
fn defs_by_id(root: &Schema) -> HashMap<String, String> {
    root.defs
        .iter()
        .filter(|(_, def)| !def.id.is_empty())
        .map(|(name, def)| (split_fragment(&def.id).0.to_string(), name.clone()))
        .collect()
}

/// `#` + `base` + a JSON Pointer fragment. `None` for anchor fragments.
fn local_ref(base: &Ptr, fragment: &str) -> Option<String> {
    if fragment.is_empty() {
        return Some(base.to_fragment());
    }
    if !fragment.starts_with('/') {
        return None;
    }
    Some(base.add([&Ptr::parse(fragment)]).to_fragment())
}

/// Pointer of the bundled definition a node at `ptr` belongs to, if it is
/// one that carries its own `$id`.
fn document_base(ptr: &Ptr, schema: &Schema, inherited: Option<&Ptr>) -> Option<Ptr> {
    let is_bundled_def = ptr.len() == 2 && ptr.tokens()[0] == Keyword::Defs.as_str();
    if is_bundled_def && !schema.id.is_empty() {
        Some(ptr.clone())
    } else {
        inherited.cloned()
    }
}

/// Rewrite every external `$ref` to a local pointer into `root.$defs`, then
/// drop the `$id` of every definition in `root.$defs`.
///
/// Local refs inside a bundled definition are relative to that definition's
/// document and are re-based under its `#/$defs/<name>` pointer.
///
/// # Errors
///
/// Returns `BundleError::DanglingReference` for an external `$ref` that
/// matches no bundled definition.
pub fn bundle_remove_ids(root: &mut Schema) -> Result<(), BundleError> {
    let by_id = defs_by_id(root);
    let root_id = split_fragment(&root.id).0.to_string();
    rewrite_refs(&Ptr::new(), None, &by_id, &root_id, root)?;
    for def in root.defs.values_mut() {
        def.id.clear();
    }
    Ok(())
}

fn rewrite_refs(
    ptr: &Ptr,
    base: Option<&Ptr>,
    by_id: &HashMap<String, String>,
    root_id: &str,
    schema: &mut Schema,
) -> Result<(), BundleError> {
    let base = document_base(ptr, schema, base);

    if !schema.r#ref.is_empty() {
        let (location, fragment) = split_fragment(&schema.r#ref);
        if location.is_empty() {
            if let Some(base) = &base {
                if let Some(rewritten) = local_ref(base, fragment) {
                    schema.r#ref = rewritten;
                }
            }
        } else {
            let dangling = || BundleError::DanglingReference {
                ptr: ptr.clone(),
                reference: schema.r#ref.clone(),
            };
            let id = schema
                .ref_referrer
                .resolve(&schema.r#ref)
                .map_err(|source| BundleError::InvalidReference {
                    ptr: ptr.clone(),
                    reference: schema.r#ref.clone(),
                    source,
                })?;
            let target = match by_id.get(&id) {
                Some(name) => Ptr::from_tokens([Keyword::Defs.as_str(), name.as_str()]),
                None if !root_id.is_empty() && id == root_id => Ptr::new(),
                None => return Err(dangling()),
            };
            let rewritten = local_ref(&target, fragment).ok_or_else(dangling)?;
            schema.r#ref = rewritten;
            schema.ref_referrer = Referrer::None;
        }
    }

    for (rel, child) in schema.subschemas_mut() {
        rewrite_refs(&ptr.add([&rel]), base.as_ref(), by_id, root_id, child)?;
    }
    Ok(())
}

/// Delete `$defs`/`definitions` entries, anywhere in the tree, that no `$ref`
/// reaches. Repeats until nothing changes, so chains of dead definitions
/// disappear completely. A definition that only refers to itself counts as
/// unused.
///
/// Returns the number of removed definitions.
pub fn remove_unused_defs(root: &mut Schema) -> usize {
    let mut total = 0;
    loop {
        let counts = count_references(root);
        let removed = remove_unreferenced(&Ptr::new(), root, &counts);
        tracing::debug!(removed, "pruned unused definitions");
        if removed == 0 {
            return total;
        }
        total += removed;
    }
}

fn count_references(root: &Schema) -> HashMap<Ptr, usize> {
    let by_id = defs_by_id(root);
    let mut counts = HashMap::new();
    count_node(root, &Ptr::new(), None, root, &by_id, &mut counts);
    counts
}

fn count_node(
    root: &Schema,
    ptr: &Ptr,
    base: Option<&Ptr>,
    schema: &Schema,
    by_id: &HashMap<String, String>,
    counts: &mut HashMap<Ptr, usize>,
) {
    let base = document_base(ptr, schema, base);

    if let Some(target) = reference_target(schema, base.as_ref(), by_id) {
        for (step, _) in target.resolve(root) {
            // Refs from inside a node do not keep that node alive.
            if ptr.has_prefix(&step) {
                continue;
            }
            *counts.entry(step).or_default() += 1;
        }
    }

    for (rel, child) in schema.subschemas() {
        count_node(root, &ptr.add([&rel]), base.as_ref(), child, by_id, counts);
    }
}

/// Root-relative pointer a node's `$ref` points at, if it can be determined.
fn reference_target(
    schema: &Schema,
    base: Option<&Ptr>,
    by_id: &HashMap<String, String>,
) -> Option<Ptr> {
    if schema.r#ref.is_empty() {
        return None;
    }
    let (location, fragment) = split_fragment(&schema.r#ref);
    let fragment = Ptr::parse(fragment);
    if location.is_empty() {
        return Some(match base {
            Some(base) => base.add([&fragment]),
            None => fragment,
        });
    }
    let id = schema.ref_referrer.resolve(&schema.r#ref).ok()?;
    let name = by_id.get(&id)?;
    Some(Ptr::from_tokens([Keyword::Defs.as_str(), name.as_str()]).add([&fragment]))
}

fn remove_unreferenced(ptr: &Ptr, schema: &mut Schema, counts: &HashMap<Ptr, usize>) -> usize {
    if schema.is_bool() {
        return 0;
    }
    let mut removed = 0;
    for (keyword, slot) in schema.slots_mut() {
        let SlotMut::Map(defs) = slot else {
            continue;
        };
        if !keyword.is_defs() {
            continue;
        }
        defs.retain(|name, _| {
            let def_ptr = ptr.prop([keyword.as_str(), name.as_str()]);
            let used = counts.get(&def_ptr).is_some_and(|count| *count > 0);
            if !used {
                tracing::debug!(ptr = %def_ptr, "removing unused definition");
                removed += 1;
            }
            used
        });
    }
    for (rel, child) in schema.subschemas_mut() {
        removed += remove_unreferenced(&ptr.add([&rel]), child, counts);
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn def_base_name_uses_last_segment() {
        assert_eq!(def_base_name("foo.json"), "foo.json");
        assert_eq!(def_base_name("charts/app/values.schema.json"), "values.schema.json");
        assert_eq!(
            def_base_name("https://example.com/schemas/image.json?ref=main#/x"),
            "image.json"
        );
        assert_eq!(def_base_name("https://example.com/schemas/"), "schemas");
        assert_eq!(def_base_name(""), "schema");
    }

    #[test]
    fn insert_def_suffixes_collisions_and_reuses_ids() {
        let mut defs = SchemaMap::new();
        let def = |id: &str| {
            let mut schema = Schema::new();
            schema.id = id.to_string();
            schema
        };

        assert_eq!(insert_def(&mut defs, def("a/foo.json")).as_deref(), Some("foo.json"));
        assert_eq!(insert_def(&mut defs, def("b/foo.json")).as_deref(), Some("foo.json_2"));
        assert_eq!(insert_def(&mut defs, def("c/foo.json")).as_deref(), Some("foo.json_3"));
        assert_eq!(insert_def(&mut defs, def("b/foo.json")), None);
        assert_eq!(find_def(&defs, "b/foo.json"), Some("foo.json_2"));
    }

    #[test]
    fn local_ref_forms() {
        let base = Ptr::from_tokens(["$defs", "foo.json"]);
        assert_eq!(local_ref(&base, "").as_deref(), Some("#/$defs/foo.json"));
        assert_eq!(
            local_ref(&base, "/properties/a~1b").as_deref(),
            Some("#/$defs/foo.json/properties/a~1b")
        );
        assert_eq!(local_ref(&base, "anchor"), None);
        assert_eq!(local_ref(&Ptr::new(), "").as_deref(), Some("#"));
    }
}
