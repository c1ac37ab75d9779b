// 磁盘空间检查与完成校验

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::{Path, PathBuf};
use sysinfo::Disks;

/// 查询目录所在磁盘的可用空间，找不到挂载点时返回 None
pub fn available_space(dir: &Path) -> Option<u64> {
    let target: PathBuf = dir
        .canonicalize()
        .ok()
        .or_else(|| dir.parent().and_then(|p| p.canonicalize().ok()))?;

    let disks = Disks::new_with_refreshed_list();
    disks
        .list()
        .iter()
        .filter(|disk| target.starts_with(disk.mount_point()))
        .max_by_key(|disk| disk.mount_point().as_os_str().len())
        .map(|disk| disk.available_space())
}

/// 计算文件 SHA-256（阻塞，调用方放到 spawn_blocking 中）
pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file = std::fs::File::open(path)
        .with_context(|| format!("打开文件失败: {:?}", path))?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 256 * 1024];
    loop {
        let n = file.read(&mut buf).context("读取文件失败")?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}
