// 文件名推断与重名处理

use reqwest::Url;
use std::path::{Path, PathBuf};

const FALLBACK_NAME: &str = "download";

/// 去掉文件系统不允许的字符
pub fn sanitize_file_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let trimmed = cleaned.trim().trim_matches('.');
    if trimmed.is_empty() {
        FALLBACK_NAME.to_string()
    } else {
        trimmed.to_string()
    }
}

/// 从 URL 最后一段路径推断文件名
pub fn file_name_from_url(url: &str) -> String {
    let Ok(parsed) = Url::parse(url.trim()) else {
        return FALLBACK_NAME.to_string();
    };
    let segment = parsed
        .path_segments()
        .and_then(|mut segments| segments.rfind(|s| !s.is_empty()))
        .unwrap_or_default();
    sanitize_file_name(&percent_decode(segment))
}

/// 解析 Content-Disposition 中的文件名，`filename*` 优先于 `filename`
pub fn file_name_from_disposition(value: &str) -> Option<String> {
    let mut plain = None;
    let mut extended = None;

    for param in value.split(';').skip(1) {
        let Some((key, raw)) = param.split_once('=') else {
            continue;
        };
        let raw = raw.trim();
        match key.trim().to_ascii_lowercase().as_str() {
            "filename*" => {
                // charset'language'percent-encoded
                let encoded = raw.splitn(3, '\'').nth(2).unwrap_or(raw);
                extended = Some(percent_decode(encoded.trim_matches('"')));
            }
            "filename" => plain = Some(raw.trim_matches('"').to_string()),
            _ => {}
        }
    }

    extended
        .or(plain)
        .filter(|name| !name.trim().is_empty())
        .map(|name| sanitize_file_name(&name))
}

fn percent_decode(value: &str) -> String {
    urlencoding::decode(value)
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| value.to_string())
}

/// 拆分主名与扩展名（`archive.tar.gz` 只拆最后一段）
fn split_extension(name: &str) -> (&str, Option<&str>) {
    match name.rfind('.') {
        Some(pos) if pos > 0 && pos + 1 < name.len() => (&name[..pos], Some(&name[pos + 1..])),
        _ => (name, None),
    }
}

/// 处理重名：`name.ext` 已被占用时依次尝试 `name_1.ext`、`name_2.ext`...
pub fn resolve_collision<F>(dir: &Path, name: &str, is_taken: F) -> String
where
    F: Fn(&Path) -> bool,
{
    if !is_taken(&dir.join(name)) {
        return name.to_string();
    }

    let (stem, ext) = split_extension(name);
    let mut index = 1u32;
    loop {
        let candidate = match ext {
            Some(ext) => format!("{}_{}.{}", stem, index, ext),
            None => format!("{}_{}", stem, index),
        };
        let path: PathBuf = dir.join(&candidate);
        if !is_taken(&path) {
            return candidate;
        }
        index += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_file_name_from_url() {
        assert_eq!(file_name_from_url("https://a.com/dir/file.zip?x=1"), "file.zip");
        assert_eq!(file_name_from_url("https://a.com/dir/%E6%96%87%E4%BB%B6.pdf"), "文件.pdf");
        assert_eq!(file_name_from_url("https://a.com/"), "download");
        assert_eq!(file_name_from_url("https://a.com"), "download");
        assert_eq!(file_name_from_url("https://a.com/a/b/"), "b");
        assert_eq!(file_name_from_url("https://cdn.example.com\\videos\\clip.mp4"), "clip.mp4");
        assert_eq!(file_name_from_url("not a url"), "download");
    }

    #[test]
    fn test_file_name_from_disposition() {
        assert_eq!(
            file_name_from_disposition("attachment; filename=\"report 2024.pdf\""),
            Some("report 2024.pdf".to_string())
        );
        assert_eq!(
            file_name_from_disposition(
                "attachment; filename=\"fallback.txt\"; filename*=UTF-8''%E6%8A%A5%E5%91%8A.txt"
            ),
            Some("报告.txt".to_string())
        );
        assert_eq!(
            file_name_from_disposition("attachment; filename=../../etc/passwd"),
            Some("_.._etc_passwd".to_string())
        );
        assert_eq!(file_name_from_disposition("inline"), None);
        assert_eq!(file_name_from_disposition("attachment; filename=\"\""), None);
    }

    #[test]
    fn test_sanitize_file_name() {
        assert_eq!(sanitize_file_name("a/b:c?.txt"), "a_b_c_.txt");
        assert_eq!(sanitize_file_name("  ..  "), "download");
    }

    #[test]
    fn test_resolve_collision() {
        let dir = Path::new("/data");
        let taken: HashSet<PathBuf> = ["/data/video.mp4", "/data/video_1.mp4", "/data/README"]
            .iter()
            .map(PathBuf::from)
            .collect();
        let is_taken = |p: &Path| taken.contains(p);

        assert_eq!(resolve_collision(dir, "other.mp4", is_taken), "other.mp4");
        assert_eq!(resolve_collision(dir, "video.mp4", is_taken), "video_2.mp4");
        assert_eq!(resolve_collision(dir, "README", is_taken), "README_1");
    }

    #[test]
    fn test_split_extension() {
        assert_eq!(split_extension("a.tar.gz"), ("a.tar", Some("gz")));
        assert_eq!(split_extension(".hidden"), (".hidden", None));
        assert_eq!(split_extension("noext"), ("noext", None));
    }
}
