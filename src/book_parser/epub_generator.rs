//! EPUB packager: canonical on-disk form into e-book containers.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{anyhow, Context, Result};
use epub_builder::{EpubBuilder, EpubContent, EpubVersion, ReferenceType, ZipLibrary};
use regex::Regex;
use tracing::{info, warn};

use crate::base_system::format_filename;
use crate::book_parser::html_utils::sanitize_xhtml;
use crate::download::models::{NovelRecord, VolumeRecord};

fn re_img_tag() -> &'static Regex {
    static R: OnceLock<Regex> = OnceLock::new();
    R.get_or_init(|| Regex::new(r"(?is)<img\b[^>]*?>").unwrap())
}

fn re_src_attr() -> &'static Regex {
    static R: OnceLock<Regex> = OnceLock::new();
    R.get_or_init(|| Regex::new(r#"(?is)\bsrc\s*=\s*['"]([^'"]+)['"]"#).unwrap())
}

const STYLESHEET: &str = "\
body { margin: 0; padding: 5px; text-align: justify; line-height: 1.4em; font-family: serif; }
h1, h2, h3 { text-align: center; margin: 1em 0; font-weight: bold; }
img { display: block; margin: 10px auto; max-width: 100%; height: auto; }
p { margin-bottom: 1em; text-indent: 1em; }
.center { text-align: center; }
nav#toc ol { list-style-type: none; padding-left: 0; }
nav#toc > ol > li { margin-top: 1em; font-weight: bold; }
nav#toc > ol > li > ol { list-style-type: none; padding-left: 1.5em; font-weight: normal; }
nav#toc > ol > li > ol > li { margin-top: 0.5em; }
nav#toc a { text-decoration: none; color: inherit; }
nav#toc a:hover { text-decoration: underline; color: blue; }
a.footnote-link { vertical-align: super; font-size: 0.75em; text-decoration: none; color: #007bff; margin-left: 2px; }
aside.footnote-content { margin-top: 1em; padding: 0.5em; border-top: 1px solid #ccc; font-size: 0.9em; color: #333; background-color: #f9f9f9; display: block; }
aside.footnote-content p { margin: 0; text-indent: 0; }
aside.footnote-content div.note-header { font-weight: bold; margin-bottom: 0.5em; color: #555; }
";

#[derive(Debug, Clone)]
pub struct PackagerOptions {
    pub compress_images: bool,
    pub output_dir: PathBuf,
}

impl Default for PackagerOptions {
    fn default() -> Self {
        Self {
            compress_images: false,
            output_dir: PathBuf::from("result"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProcessedImage {
    pub bytes: Vec<u8>,
    pub mime: String,
    pub rel_path: String,
}

/// Builds merged or per-volume EPUBs from a base directory holding
/// `metadata.json`, the volume records and `images/`.
pub struct EpubPackager {
    base_dir: PathBuf,
    options: PackagerOptions,
    meta: NovelRecord,
    image_cache: HashMap<String, Option<ProcessedImage>>,
}

impl EpubPackager {
    pub fn new(base_dir: &Path, options: PackagerOptions) -> Self {
        let meta_path = base_dir.join("metadata.json");
        let meta = fs::read_to_string(&meta_path)
            .ok()
            .and_then(|raw| serde_json::from_str::<NovelRecord>(&raw).ok())
            .unwrap_or_else(|| NovelRecord {
                novel_name: "Unknown".to_string(),
                author: "Unknown".to_string(),
                ..NovelRecord::default()
            });

        Self {
            base_dir: base_dir.to_path_buf(),
            options,
            meta,
            image_cache: HashMap::new(),
        }
    }

    pub fn meta(&self) -> &NovelRecord {
        &self.meta
    }

    pub fn clear_cache(&mut self) {
        self.image_cache.clear();
    }

    /// Loads, optionally transcodes and memoizes one image. `None` means
    /// the file is missing or empty and the reference should be dropped.
    pub fn process_image(&mut self, rel_path: &str) -> Option<ProcessedImage> {
        if rel_path.is_empty() {
            return None;
        }
        if let Some(cached) = self.image_cache.get(rel_path) {
            return cached.clone();
        }
        let produced = self.load_image(rel_path);
        self.image_cache.insert(rel_path.to_string(), produced.clone());
        produced
    }

    fn load_image(&self, rel_path: &str) -> Option<ProcessedImage> {
        let full = self.base_dir.join(rel_path);
        let bytes = fs::read(&full).ok()?;
        if bytes.is_empty() {
            return None;
        }

        if !self.options.compress_images {
            return Some(ProcessedImage {
                mime: mime_from_path(rel_path).to_string(),
                bytes,
                rel_path: rel_path.to_string(),
            });
        }

        match try_convert_to_jpeg(&bytes, 75) {
            Some(jpeg) => {
                let stem = rel_path
                    .rfind('.')
                    .map(|dot| &rel_path[..dot])
                    .unwrap_or(rel_path);
                Some(ProcessedImage {
                    bytes: jpeg,
                    mime: "image/jpeg".to_string(),
                    rel_path: format!("{stem}.jpg"),
                })
            }
            None => {
                warn!("jpeg transcode failed for {rel_path}, keeping original");
                Some(ProcessedImage {
                    mime: mime_from_path(rel_path).to_string(),
                    bytes,
                    rel_path: rel_path.to_string(),
                })
            }
        }
    }

    /// One container holding every volume: an intro section, then a
    /// separator page plus chapters per volume, TOC nested volume→chapter.
    pub fn build_merged(&mut self, volume_files: &[String]) -> Result<PathBuf> {
        let mut files = volume_files.to_vec();
        let order: HashMap<String, usize> = self
            .meta
            .volumes
            .iter()
            .map(|v| (v.filename.clone(), v.order))
            .collect();
        files.sort_by_key(|f| order.get(f).copied().unwrap_or(usize::MAX));

        let mut book = self.new_builder(&self.meta.novel_name.clone())?;
        let mut added: HashSet<String> = HashSet::new();

        self.add_intro(&mut book, "Toàn tập", &mut added)?;

        for (i, file) in files.iter().enumerate() {
            info!("merging: {}", file);
            let record = self.read_volume(file)?;

            let mut section = String::new();
            if !record.cover_image_local.is_empty() {
                if let Some(img) = self.process_image(&record.cover_image_local) {
                    add_image_resource(&mut book, &img, &mut added)?;
                    section.push_str(&format!(
                        "<img src=\"{}\" alt=\"Vol Cover\" style=\"max-height: 50vh;\"/>",
                        img.rel_path
                    ));
                }
            }
            section.push_str(&format!("<h1>{}</h1>", escape_html(&record.volume_name)));
            let separator = format!(
                "<div style=\"text-align: center; margin-top: 30vh;\">{section}</div>"
            );
            book.add_content(
                EpubContent::new(
                    format!("vol_{i}.xhtml"),
                    Cursor::new(wrap_xhtml(&record.volume_name, &separator)),
                )
                .title(&record.volume_name)
                .reftype(ReferenceType::Text),
            )
            .map_err(|e| anyhow!(e.to_string()))?;

            for chapter in &record.chapters {
                let body = self.embed_images(&mut book, &chapter.content, &mut added)?;
                let page = format!(
                    "<h2>{}</h2>{}",
                    escape_html(&chapter.title),
                    sanitize_xhtml(&body)
                );
                book.add_content(
                    EpubContent::new(
                        format!("v{i}_c{}.xhtml", chapter.index),
                        Cursor::new(wrap_xhtml(&chapter.title, &page)),
                    )
                    .title(&chapter.title)
                    .reftype(ReferenceType::Text)
                    .level(2),
                )
                .map_err(|e| anyhow!(e.to_string()))?;
            }
        }

        let filename = format!(
            "{}.epub",
            format_filename(&format!("{} Full", self.meta.novel_name))
        );
        let out_path = self.output_path(&filename, true);
        self.write_book(&mut book, &out_path)?;
        Ok(out_path)
    }

    /// A single-volume container titled `"<volume> - <novel>"`.
    pub fn build_volume(&mut self, volume_file: &str) -> Result<PathBuf> {
        let record = self.read_volume(volume_file)?;
        let title = format!("{} - {}", record.volume_name, self.meta.novel_name);

        let mut book = self.new_builder(&title)?;
        let mut added: HashSet<String> = HashSet::new();

        self.add_intro(&mut book, &record.volume_name, &mut added)?;

        for chapter in &record.chapters {
            let body = self.embed_images(&mut book, &chapter.content, &mut added)?;
            let page = format!(
                "<h2>{}</h2>{}",
                escape_html(&chapter.title),
                sanitize_xhtml(&body)
            );
            book.add_content(
                EpubContent::new(
                    format!("c{}.xhtml", chapter.index),
                    Cursor::new(wrap_xhtml(&chapter.title, &page)),
                )
                .title(&chapter.title)
                .reftype(ReferenceType::Text),
            )
            .map_err(|e| anyhow!(e.to_string()))?;
        }

        let filename = format!("{}.epub", format_filename(&title));
        let out_path = self.output_path(&filename, false);
        self.write_book(&mut book, &out_path)?;
        Ok(out_path)
    }

    fn new_builder(&self, title: &str) -> Result<EpubBuilder<ZipLibrary>> {
        let zip = ZipLibrary::new().map_err(|e| anyhow!(e.to_string()))?;
        let mut book = EpubBuilder::new(zip).map_err(|e| anyhow!(e.to_string()))?;
        book.epub_version(EpubVersion::V30);
        book.metadata("title", title).ok();
        book.metadata("lang", "vi").ok();
        book.metadata("toc_name", title).ok();

        let author = self.meta.author.trim();
        if !author.is_empty() {
            book.metadata("author", author).ok();
        }
        let summary = self.meta.summary.trim();
        if !summary.is_empty() {
            book.metadata("description", summary).ok();
        }
        for tag in &self.meta.tags {
            if !tag.trim().is_empty() {
                book.metadata("subject", tag.trim()).ok();
            }
        }
        book.metadata("generator", "hako-crawler").ok();

        book.stylesheet(Cursor::new(STYLESHEET.to_string()))
            .map_err(|e| anyhow!(e.to_string()))?;
        Ok(book)
    }

    fn add_intro(
        &mut self,
        book: &mut EpubBuilder<ZipLibrary>,
        section_name: &str,
        added: &mut HashSet<String>,
    ) -> Result<()> {
        let title = escape_html(&self.meta.novel_name);
        let author = escape_html(&self.meta.author);
        let tags_html = if self.meta.tags.is_empty() {
            String::new()
        } else {
            format!(
                "<p><b>Thể loại:</b> {}</p>",
                escape_html(&self.meta.tags.join(", "))
            )
        };

        let mut cover_html = "<hr/>".to_string();
        let cover_rel = self.meta.cover_image_local.clone();
        if !cover_rel.is_empty() {
            if let Some(img) = self.process_image(&cover_rel) {
                book.add_cover_image(
                    &img.rel_path,
                    Cursor::new(img.bytes.clone()),
                    &img.mime,
                )
                .map_err(|e| anyhow!(e.to_string()))?;
                added.insert(img.rel_path.clone());
                cover_html = format!(
                    "<div style=\"text-align:center; margin: 2em 0; page-break-after: always; break-after: page;\"><img src=\"{}\" alt=\"Cover\"/></div>",
                    img.rel_path
                );
            }
        }

        let summary = sanitize_xhtml(&self.meta.summary);
        let content = format!(
            "<div style=\"text-align: center; margin-top: 5%;\">\n\
             <h1>{title}</h1>\n\
             <h3 style=\"margin-bottom: 0.5em;\">{}</h3>\n\
             <p><b>Tác giả:</b> {author}</p>\n\
             {tags_html}\n\
             {cover_html}\n\
             <div style=\"text-align: justify;\">{summary}</div>\n\
             </div>",
            escape_html(section_name)
        );

        book.add_content(
            EpubContent::new("intro.xhtml", Cursor::new(wrap_xhtml("Giới thiệu", &content)))
                .title("Giới thiệu")
                .reftype(ReferenceType::Text),
        )
        .map_err(|e| anyhow!(e.to_string()))?;
        Ok(())
    }

    /// Rewrites every `<img src>` in the chapter body to a processed
    /// container resource; unprocessable images are removed.
    fn embed_images(
        &mut self,
        book: &mut EpubBuilder<ZipLibrary>,
        content: &str,
        added: &mut HashSet<String>,
    ) -> Result<String> {
        let mut out = String::with_capacity(content.len());
        let mut last = 0;
        for m in re_img_tag().find_iter(content) {
            out.push_str(&content[last..m.start()]);
            last = m.end();

            let src = re_src_attr()
                .captures(m.as_str())
                .and_then(|c| c.get(1))
                .map(|c| c.as_str())
                .unwrap_or("");
            if src.is_empty() {
                continue;
            }
            if let Some(img) = self.process_image(src) {
                add_image_resource(book, &img, added)?;
                out.push_str(&format!("<img alt=\"\" src=\"{}\"/>", img.rel_path));
            }
        }
        out.push_str(&content[last..]);
        Ok(out)
    }

    fn read_volume(&self, volume_file: &str) -> Result<VolumeRecord> {
        let path = self.base_dir.join(volume_file);
        let raw =
            fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("parse {}", path.display()))
    }

    fn output_path(&self, filename: &str, is_merged: bool) -> PathBuf {
        let slug = format_filename(&self.meta.novel_name);
        if is_merged && !self.options.compress_images {
            return self.options.output_dir.join(filename);
        }
        let subfolder = if self.options.compress_images {
            "compressed"
        } else {
            "original"
        };
        self.options.output_dir.join(slug).join(subfolder).join(filename)
    }

    fn write_book(&self, book: &mut EpubBuilder<ZipLibrary>, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut buffer = Vec::new();
        book.generate(&mut buffer)
            .map_err(|e| anyhow!(e.to_string()))?;

        let tmp = path.with_extension("epub.part");
        fs::write(&tmp, &buffer).with_context(|| format!("write {}", tmp.display()))?;
        fs::rename(&tmp, path).with_context(|| format!("move into {}", path.display()))?;
        info!("created EPUB: {}", path.display());
        Ok(())
    }
}

fn add_image_resource(
    book: &mut EpubBuilder<ZipLibrary>,
    img: &ProcessedImage,
    added: &mut HashSet<String>,
) -> Result<()> {
    if added.insert(img.rel_path.clone()) {
        book.add_resource(&img.rel_path, Cursor::new(img.bytes.clone()), &img.mime)
            .map_err(|e| anyhow!(e.to_string()))?;
    }
    Ok(())
}

pub(crate) fn mime_from_path(path: &str) -> &'static str {
    let lower = path.to_ascii_lowercase();
    if lower.ends_with(".png") {
        "image/png"
    } else if lower.ends_with(".gif") {
        "image/gif"
    } else if lower.ends_with(".webp") {
        "image/webp"
    } else {
        "image/jpeg"
    }
}

fn try_convert_to_jpeg(bytes: &[u8], quality: u8) -> Option<Vec<u8>> {
    let img = image::load_from_memory(bytes).ok()?;
    let rgb = img.to_rgb8();
    let mut out = Vec::new();
    let mut encoder =
        image::codecs::jpeg::JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100));
    encoder
        .encode(
            &rgb,
            rgb.width(),
            rgb.height(),
            image::ExtendedColorType::Rgb8,
        )
        .ok()?;
    Some(out)
}

fn escape_html(input: &str) -> String {
    input
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#39;")
}

fn wrap_xhtml(title: &str, body: &str) -> String {
    let escaped_title = escape_html(title);
    let body = body.replace("<br>", "<br/>").replace("<br >", "<br/>");
    format!(
        "<?xml version='1.0' encoding='utf-8'?>\n<!DOCTYPE html>\n<html xmlns=\"http://www.w3.org/1999/xhtml\" xmlns:epub=\"http://www.idpf.org/2007/ops\" lang=\"vi\" xml:lang=\"vi\">\n  <head>\n    <title>{escaped_title}</title>\n    <link href=\"stylesheet.css\" rel=\"stylesheet\" type=\"text/css\"/>\n  </head>\n  <body>\n{body}\n  </body>\n</html>"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mime_follows_extension() {
        assert_eq!(mime_from_path("images/a.png"), "image/png");
        assert_eq!(mime_from_path("images/a.GIF"), "image/gif");
        assert_eq!(mime_from_path("images/a.webp"), "image/webp");
        assert_eq!(mime_from_path("images/a.jpg"), "image/jpeg");
        assert_eq!(mime_from_path("images/a.jpeg"), "image/jpeg");
    }

    #[test]
    fn missing_image_is_memoized_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let mut packager = EpubPackager::new(dir.path(), PackagerOptions::default());
        assert!(packager.process_image("images/none.jpg").is_none());
        assert!(packager.process_image("images/none.jpg").is_none());
        assert!(packager.process_image("").is_none());
    }

    #[test]
    fn empty_image_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("images")).unwrap();
        std::fs::File::create(dir.path().join("images/empty.png")).unwrap();
        let mut packager = EpubPackager::new(dir.path(), PackagerOptions::default());
        assert!(packager.process_image("images/empty.png").is_none());
    }

    #[test]
    fn uncompressed_image_keeps_bytes_and_path() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("images")).unwrap();
        std::fs::write(dir.path().join("images/raw.png"), b"not-really-png").unwrap();
        let mut packager = EpubPackager::new(dir.path(), PackagerOptions::default());
        let img = packager.process_image("images/raw.png").unwrap();
        assert_eq!(img.rel_path, "images/raw.png");
        assert_eq!(img.mime, "image/png");
        assert_eq!(img.bytes, b"not-really-png");
    }

    #[test]
    fn compression_falls_back_on_undecodable_bytes() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("images")).unwrap();
        std::fs::write(dir.path().join("images/junk.png"), b"junk").unwrap();
        let options = PackagerOptions {
            compress_images: true,
            output_dir: dir.path().join("result"),
        };
        let mut packager = EpubPackager::new(dir.path(), options);
        let img = packager.process_image("images/junk.png").unwrap();
        assert_eq!(img.rel_path, "images/junk.png");
        assert_eq!(img.mime, "image/png");
    }

    #[test]
    fn output_paths_follow_compression_mode() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("metadata.json"),
            r#"{"novelName":"My Novel","author":"A"}"#,
        )
        .unwrap();

        let plain = EpubPackager::new(
            dir.path(),
            PackagerOptions {
                compress_images: false,
                output_dir: PathBuf::from("result"),
            },
        );
        assert_eq!(
            plain.output_path("My_Novel_Full.epub", true),
            PathBuf::from("result/My_Novel_Full.epub")
        );
        assert_eq!(
            plain.output_path("v.epub", false),
            PathBuf::from("result/My_Novel/original/v.epub")
        );

        let squeezed = EpubPackager::new(
            dir.path(),
            PackagerOptions {
                compress_images: true,
                output_dir: PathBuf::from("result"),
            },
        );
        assert_eq!(
            squeezed.output_path("My_Novel_Full.epub", true),
            PathBuf::from("result/My_Novel/compressed/My_Novel_Full.epub")
        );
    }
}
