//! Materialised folder-tree maintenance.

use std::collections::{HashMap, HashSet};

use sea_orm::{ConnectionTrait, DatabaseTransaction};
use tracing::debug;

use db::dialect::Dialect;

use crate::error::Result;
use crate::kind::STANDARD_KIND_FOLDER;

struct FolderRow {
    guid: String,
    uid: String,
    parent: String,
    slug: String,
}

/// Recompute the materialised ancestry for every folder entity of the
/// tenant. Runs inside the caller's write transaction so the tree is
/// consistent with the folder set before commit.
pub(crate) async fn update_folder_tree(
    txn: &DatabaseTransaction,
    dialect: &Dialect,
    tenant_id: i64,
) -> Result<()> {
    txn.execute(dialect.statement(
        "DELETE FROM entity_folder_tree WHERE tenant_id=?".to_string(),
        vec![tenant_id.into()],
    ))
    .await?;

    let rows = txn
        .query_all(dialect.statement(
            "SELECT guid,uid,folder,slug FROM entity WHERE (tenant_id=? AND kind=?)".to_string(),
            vec![tenant_id.into(), STANDARD_KIND_FOLDER.into()],
        ))
        .await?;

    let mut folders = Vec::with_capacity(rows.len());
    for row in rows {
        folders.push(FolderRow {
            guid: row.try_get_by_index(0)?,
            uid: row.try_get_by_index(1)?,
            parent: row.try_get_by_index(2)?,
            slug: row.try_get_by_index(3)?,
        });
    }
    let by_uid: HashMap<&str, &FolderRow> =
        folders.iter().map(|f| (f.uid.as_str(), f)).collect();

    for folder in &folders {
        // Walk to the root, guarding against missing parents and cycles.
        let mut chain: Vec<&FolderRow> = vec![folder];
        let mut seen: HashSet<&str> = HashSet::new();
        seen.insert(folder.uid.as_str());
        let mut cursor = folder;
        let mut detached = false;
        while !cursor.parent.is_empty() {
            match by_uid.get(cursor.parent.as_str()) {
                Some(&parent) if !seen.contains(parent.uid.as_str()) => {
                    seen.insert(parent.uid.as_str());
                    chain.push(parent);
                    cursor = parent;
                }
                _ => {
                    detached = true;
                    break;
                }
            }
        }
        chain.reverse();

        let tree: Vec<&str> = chain.iter().map(|f| f.uid.as_str()).collect();
        let slug_path = format!(
            "/{}/",
            chain
                .iter()
                .map(|f| f.slug.as_str())
                .collect::<Vec<_>>()
                .join("/")
        );

        let stmt = dialect.insert_query(
            "entity_folder_tree",
            &[
                ("guid", folder.guid.as_str().into()),
                ("tenant_id", tenant_id.into()),
                ("uid", folder.uid.as_str().into()),
                ("slug_path", slug_path.as_str().into()),
                ("tree", serde_json::to_string(&tree)?.into()),
                ("depth", (chain.len() as i64).into()),
                ("detached", detached.into()),
            ],
        );
        txn.execute(stmt).await?;
    }

    debug!(tenant_id, folders = folders.len(), "rebuilt folder tree");
    Ok(())
}
