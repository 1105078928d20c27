//! Per-volume chapter acquisition with content-aware caching.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use scraper::{Html, Selector};
use tracing::{error, info, warn};

use crate::base_system::{book_list, format_filename, BOOKS_FILE};
use crate::book_parser::html_utils;
use crate::book_parser::models::{ChapterRef, Novel, Volume};
use crate::download::models::{ChapterContent, NovelRecord, VolumeDescriptor, VolumeRecord};
use crate::network::NetworkFabric;

fn sel_chapter_content() -> &'static Selector {
    static S: OnceLock<Selector> = OnceLock::new();
    S.get_or_init(|| Selector::parse("#chapter-content").unwrap())
}

fn sel_img() -> &'static Selector {
    static S: OnceLock<Selector> = OnceLock::new();
    S.get_or_init(|| Selector::parse("img").unwrap())
}

/// Extension by substring test of the URL; jpg is the fallback.
pub(crate) fn image_ext(url: &str) -> &'static str {
    if url.contains(".png") {
        "png"
    } else if url.contains(".gif") {
        "gif"
    } else if url.contains(".webp") {
        "webp"
    } else {
        "jpg"
    }
}

pub(crate) fn chapter_image_name(
    vol_slug: &str,
    chapter_index: usize,
    image_index: usize,
    ext: &str,
) -> String {
    format!("{vol_slug}_chap_{chapter_index}_img_{image_index}.{ext}")
}

/// Owns materialization and persistence for one novel's base directory.
pub struct NovelDownloader<'a> {
    novel: Novel,
    base_dir: PathBuf,
    images_dir: PathBuf,
    fabric: &'a NetworkFabric,
}

impl<'a> NovelDownloader<'a> {
    pub fn new(novel: Novel, base_dir: &Path, fabric: &'a NetworkFabric) -> std::io::Result<Self> {
        let images_dir = base_dir.join("images");
        fs::create_dir_all(&images_dir)?;
        Ok(Self {
            novel,
            base_dir: base_dir.to_path_buf(),
            images_dir,
            fabric,
        })
    }

    pub fn novel(&self) -> &Novel {
        &self.novel
    }

    /// Writes `metadata.json` (downloading the main cover first) and
    /// registers the book folder in the index.
    pub fn create_metadata_file(&self) -> Result<()> {
        fs::create_dir_all(&self.images_dir)?;
        info!("updating metadata for: {}", self.novel.name);

        let mut cover_local = String::new();
        if !self.novel.main_cover.is_empty() {
            let name = format!("main_cover.{}", image_ext(&self.novel.main_cover));
            if self
                .fabric
                .download_to_file(&self.novel.main_cover, &self.images_dir.join(&name))
            {
                cover_local = format!("images/{name}");
            }
        }

        let volumes = self
            .novel
            .volumes
            .iter()
            .enumerate()
            .map(|(i, v)| VolumeDescriptor {
                order: i + 1,
                name: v.name.clone(),
                filename: format!("{}.json", format_filename(&v.name)),
                url: v.url.clone(),
            })
            .collect();

        let record = NovelRecord {
            novel_name: self.novel.name.clone(),
            author: self.novel.author.clone(),
            tags: self.novel.tags.clone(),
            summary: self.novel.summary.clone(),
            cover_image_local: cover_local,
            url: self.novel.url.clone(),
            volumes,
        };

        let path = self.base_dir.join("metadata.json");
        fs::write(&path, serde_json::to_string_pretty(&record)?)
            .with_context(|| format!("write {}", path.display()))?;

        if let Some(folder) = self.base_dir.file_name().and_then(|n| n.to_str()) {
            book_list::add_book(Path::new(BOOKS_FILE), folder);
        }
        Ok(())
    }

    /// Idempotent per volume: validated cached chapters are reused and
    /// re-stamped, the rest are fetched serially with a 500 ms gap.
    pub fn download_volume(
        &self,
        volume: &Volume,
        mut progress: Option<&mut dyn FnMut(usize, usize)>,
    ) -> Result<()> {
        let json_path = self
            .base_dir
            .join(format!("{}.json", format_filename(&volume.name)));
        let vol_slug = format_filename(&volume.name).to_lowercase();

        let mut existing: HashMap<String, ChapterContent> = HashMap::new();
        if json_path.exists() {
            let cached = fs::read_to_string(&json_path)
                .ok()
                .and_then(|raw| serde_json::from_str::<VolumeRecord>(&raw).ok());
            match cached {
                Some(record) => {
                    for chapter in record.chapters {
                        existing.insert(chapter.url.clone(), chapter);
                    }
                }
                None => warn!("existing volume record is corrupt, re-downloading"),
            }
        }

        info!("processing volume: {}", volume.name);

        let mut final_chapters: Vec<ChapterContent> = Vec::new();
        let mut pending: Vec<(usize, &ChapterRef)> = Vec::new();
        let mut cached_count = 0usize;

        for (i, chapter) in volume.chapters.iter().enumerate() {
            match existing.remove(&chapter.url) {
                Some(mut cc) if self.validate_cached(&cc) => {
                    cc.index = i;
                    final_chapters.push(cc);
                    cached_count += 1;
                }
                _ => pending.push((i, chapter)),
            }
        }

        let total = pending.len();
        info!("cached: {} | re-downloading: {}", cached_count, total);

        let bar = if progress.is_none() && total > 0 {
            let bar = ProgressBar::new(total as u64);
            bar.set_style(
                ProgressStyle::with_template("{prefix} [{elapsed_precise}] {wide_bar} {pos}/{len}")?
                    .progress_chars("##-"),
            );
            bar.set_prefix(volume.name.clone());
            Some(bar)
        } else {
            None
        };

        for (done, (i, chapter)) in pending.into_iter().enumerate() {
            if let Some(content) = self.process_chapter(i, chapter, &vol_slug) {
                final_chapters.push(content);
            }
            if let Some(cb) = progress.as_deref_mut() {
                cb(done + 1, total);
            }
            if let Some(bar) = &bar {
                bar.inc(1);
            }
            thread::sleep(Duration::from_millis(500));
        }
        if let Some(bar) = bar {
            bar.finish_and_clear();
        }

        final_chapters.sort_by_key(|c| c.index);

        let mut cover_local = String::new();
        if !volume.cover_img.is_empty() {
            let name = format!(
                "vol_cover_{}.{}",
                format_filename(&volume.name),
                image_ext(&volume.cover_img)
            );
            if self
                .fabric
                .download_to_file(&volume.cover_img, &self.images_dir.join(&name))
            {
                cover_local = format!("images/{name}");
            }
        }

        let record = VolumeRecord {
            volume_name: volume.name.clone(),
            volume_url: volume.url.clone(),
            cover_image_local: cover_local,
            chapters: final_chapters,
        };
        fs::write(&json_path, serde_json::to_string_pretty(&record)?)
            .with_context(|| format!("write {}", json_path.display()))?;
        info!("saved: {}", json_path.display());
        Ok(())
    }

    /// A cached chapter survives only when its body is substantial and
    /// every local image it references still exists with non-zero size.
    pub fn validate_cached(&self, chapter: &ChapterContent) -> bool {
        if chapter.content.chars().count() < 50 {
            return false;
        }
        let doc = Html::parse_fragment(&chapter.content);
        for img in doc.select(sel_img()) {
            let Some(src) = img.value().attr("src") else {
                continue;
            };
            if !src.starts_with("images/") {
                continue;
            }
            match fs::metadata(self.base_dir.join(src)) {
                Ok(meta) if meta.is_file() && meta.len() > 0 => {}
                _ => return false,
            }
        }
        true
    }

    /// Fetches one chapter, scrubs its `#chapter-content` subtree,
    /// localizes images and rewrites footnotes. `None` skips the chapter.
    pub fn process_chapter(
        &self,
        index: usize,
        chapter: &ChapterRef,
        vol_slug: &str,
    ) -> Option<ChapterContent> {
        let page = match self.fabric.fetch_with_retry(&chapter.url) {
            Ok(resp) => match resp.text() {
                Ok(text) => text,
                Err(e) => {
                    error!("err {}: {}", chapter.url, e);
                    return None;
                }
            },
            Err(e) => {
                error!("err {}: {}", chapter.url, e);
                return None;
            }
        };

        let doc = Html::parse_document(&page);
        let Some(content) = doc.select(sel_chapter_content()).next() else {
            warn!("no chapter content found: {}", chapter.url);
            return None;
        };

        let mut fragment = Html::parse_fragment(&content.html());
        html_utils::remove_comment_nodes(&mut fragment);
        html_utils::remove_blank_targets(&mut fragment);
        html_utils::remove_hidden_elements(&mut fragment);

        self.localize_images(&mut fragment, index, vol_slug);

        html_utils::remove_empty_containers(&mut fragment);

        // Footnote definitions can sit outside the content subtree.
        let notes = html_utils::collect_footnotes(&doc);
        html_utils::strip_footnote_divs(&mut fragment);

        let serialized = fragment.root_element().inner_html();
        let slug = format!("{vol_slug}_ch{index}");
        let (converted, used) = html_utils::convert_footnote_markers(&serialized, &notes, &slug);
        let asides = html_utils::generate_footnote_asides(&used, &notes, &slug, true);
        let body = html_utils::collapse_newlines(&format!("{converted}{asides}"));

        Some(ChapterContent {
            title: chapter.name.clone(),
            url: chapter.url.clone(),
            content: body,
            index,
        })
    }

    /// Downloads every chapter image under a deterministic local name and
    /// rewrites its `src`; banner and failed images are dropped.
    fn localize_images(&self, fragment: &mut Html, chapter_index: usize, vol_slug: &str) {
        let imgs: Vec<_> = fragment.select(sel_img()).map(|e| e.id()).collect();
        for (m, id) in imgs.into_iter().enumerate() {
            let src = fragment
                .tree
                .get(id)
                .and_then(scraper::ElementRef::wrap)
                .and_then(|el| el.value().attr("src"))
                .unwrap_or_default()
                .to_string();

            if src.is_empty() || src.contains("chapter-banners") {
                if let Some(mut node) = fragment.tree.get_mut(id) {
                    node.detach();
                }
                continue;
            }

            let name = chapter_image_name(vol_slug, chapter_index, m, image_ext(&src));
            if self.fabric.download_to_file(&src, &self.images_dir.join(&name)) {
                let local = format!("images/{name}");
                if let Some(mut node) = fragment.tree.get_mut(id) {
                    if let scraper::Node::Element(el) = node.value() {
                        for (key, value) in el.attrs.iter_mut() {
                            if key.local.as_ref() == "src" {
                                *value = local.clone().into();
                            }
                        }
                        let doomed: Vec<_> = el
                            .attrs
                            .keys()
                            .filter(|k| matches!(k.local.as_ref(), "style" | "onclick"))
                            .cloned()
                            .collect();
                        for key in doomed {
                            el.attrs.remove(&key);
                        }
                    }
                }
            } else if let Some(mut node) = fragment.tree.get_mut(id) {
                node.detach();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::FabricConfig;
    use std::io::Write;
    use std::sync::OnceLock;

    fn fabric() -> &'static NetworkFabric {
        static F: OnceLock<NetworkFabric> = OnceLock::new();
        F.get_or_init(|| NetworkFabric::new(FabricConfig::default()).unwrap())
    }

    fn downloader(dir: &Path) -> NovelDownloader<'static> {
        let novel = Novel {
            name: "N".to_string(),
            url: "https://docln.net/truyen/5".to_string(),
            ..Novel::default()
        };
        NovelDownloader::new(novel, dir, fabric()).unwrap()
    }

    fn chapter(content: &str) -> ChapterContent {
        ChapterContent {
            title: "c".to_string(),
            url: "https://docln.net/t/5/c1".to_string(),
            content: content.to_string(),
            index: 0,
        }
    }

    #[test]
    fn short_content_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let dl = downloader(dir.path());
        assert!(!dl.validate_cached(&chapter("")));
        assert!(!dl.validate_cached(&chapter("<p>ngắn</p>")));
    }

    #[test]
    fn substantial_text_only_chapter_is_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let dl = downloader(dir.path());
        let body = format!("<p>{}</p>", "x".repeat(140));
        assert!(dl.validate_cached(&chapter(&body)));
    }

    #[test]
    fn missing_local_image_invalidates_cache() {
        let dir = tempfile::tempdir().unwrap();
        let dl = downloader(dir.path());
        let body = format!(
            "<p>{}</p><img src=\"images/missing.jpg\">",
            "x".repeat(140)
        );
        assert!(!dl.validate_cached(&chapter(&body)));
    }

    #[test]
    fn empty_local_image_invalidates_cache() {
        let dir = tempfile::tempdir().unwrap();
        let dl = downloader(dir.path());
        fs::File::create(dir.path().join("images/empty.png")).unwrap();
        let body = format!("<p>{}</p><img src=\"images/empty.png\">", "x".repeat(140));
        assert!(!dl.validate_cached(&chapter(&body)));
    }

    #[test]
    fn present_local_image_passes_validation() {
        let dir = tempfile::tempdir().unwrap();
        let dl = downloader(dir.path());
        let mut file = fs::File::create(dir.path().join("images/ok.png")).unwrap();
        file.write_all(b"png bytes").unwrap();
        let body = format!("<p>{}</p><img src=\"images/ok.png\">", "x".repeat(140));
        assert!(dl.validate_cached(&chapter(&body)));
    }

    #[test]
    fn remote_images_are_ignored_by_validation() {
        let dir = tempfile::tempdir().unwrap();
        let dl = downloader(dir.path());
        let body = format!(
            "<p>{}</p><img src=\"https://i.hako.vip/x.jpg\">",
            "x".repeat(140)
        );
        assert!(dl.validate_cached(&chapter(&body)));
    }

    #[test]
    fn extension_is_chosen_by_substring() {
        assert_eq!(image_ext("https://i.hako.vip/a.png?x=1"), "png");
        assert_eq!(image_ext("https://i.hako.vip/a.gif"), "gif");
        assert_eq!(image_ext("https://i.hako.vip/a.webp"), "webp");
        assert_eq!(image_ext("https://i.hako.vip/a"), "jpg");
    }

    #[test]
    fn image_names_follow_the_contract() {
        let re = regex::Regex::new(r"^tập_1_chap_3_img_0\.(png|gif|webp|jpg)$").unwrap();
        let name = chapter_image_name("tập_1", 3, 0, image_ext("x.png"));
        assert!(re.is_match(&name), "unexpected name: {name}");
    }
}
