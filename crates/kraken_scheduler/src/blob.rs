use std::path::{Path, PathBuf};

use anyhow::{Context, bail};
use kraken_core::{Digest, metainfo::MetaInfo, spawn_utils::BlockingSpawner};
use sha256w::ISha256;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::piece_store::PieceStore;

fn temp_path(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().unwrap_or_default().to_os_string();
    name.push(".kraken-part");
    dest.with_file_name(name)
}

/// Assembles a complete blob from the store into `dest`.
///
/// Written to a temporary file next to `dest` and renamed once the whole-blob digest
/// checks out, so `dest` never holds partial data.
pub(crate) async fn write_blob(
    store: &dyn PieceStore,
    spawner: BlockingSpawner,
    meta: &MetaInfo,
    dest: &Path,
) -> anyhow::Result<()> {
    let lengths = meta.lengths()?;
    let tmp = temp_path(dest);
    let res = async {
        let mut file = tokio::fs::File::create(&tmp)
            .await
            .with_context(|| format!("error creating {tmp:?}"))?;
        let mut hasher = sha256w::Sha256::new();
        for index in lengths.iter_piece_indices() {
            let piece = spawner
                .spawn_block_in_place(|| store.read_piece(&meta.digest, index))?
                .with_context(|| format!("piece {} missing from store", index.get()))?;
            hasher.update(&piece);
            file.write_all(&piece)
                .await
                .with_context(|| format!("error writing {tmp:?}"))?;
        }
        file.flush().await?;
        file.sync_all().await?;

        let actual = Digest::new(hasher.finish());
        if actual != meta.digest {
            bail!("assembled blob has digest {actual}, expected {}", meta.digest);
        }
        tokio::fs::rename(&tmp, dest)
            .await
            .with_context(|| format!("error renaming {tmp:?} to {dest:?}"))?;
        Ok::<_, anyhow::Error>(())
    }
    .await;
    if res.is_err() {
        let _ = tokio::fs::remove_file(&tmp).await;
    }
    debug!(digest = %meta.digest, ?dest, ok = res.is_ok(), "wrote blob");
    res
}
