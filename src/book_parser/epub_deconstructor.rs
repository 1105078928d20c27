//! EPUB unpackager: regenerates the canonical on-disk form
//! (`metadata.json`, per-volume records, `images/`) from a container.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{anyhow, Context, Result};
use quick_xml::events::Event;
use quick_xml::Reader;
use ego_tree::NodeId;
use scraper::{ElementRef, Html, Selector};
use tracing::{info, warn};

use crate::base_system::{book_list, format_filename, BOOKS_FILE};
use crate::book_parser::html_utils;
use crate::download::models::{ChapterContent, NovelRecord, VolumeDescriptor, VolumeRecord};

const IMAGE_EXTS: [&str; 5] = ["jpg", "jpeg", "png", "gif", "webp"];

fn sel_body() -> &'static Selector {
    static S: OnceLock<Selector> = OnceLock::new();
    S.get_or_init(|| Selector::parse("body").unwrap())
}

fn sel_img() -> &'static Selector {
    static S: OnceLock<Selector> = OnceLock::new();
    S.get_or_init(|| Selector::parse("img").unwrap())
}

fn sel_heading() -> &'static Selector {
    static S: OnceLock<Selector> = OnceLock::new();
    S.get_or_init(|| Selector::parse("h1, h2, h3").unwrap())
}

fn sel_nav() -> &'static Selector {
    static S: OnceLock<Selector> = OnceLock::new();
    S.get_or_init(|| Selector::parse("nav").unwrap())
}

fn sel_ol() -> &'static Selector {
    static S: OnceLock<Selector> = OnceLock::new();
    S.get_or_init(|| Selector::parse("ol").unwrap())
}

pub struct UnpackOptions {
    pub output_dir: PathBuf,
    /// Optional hook to tidy volume titles pulled from the TOC (for
    /// containers merged out of per-volume files).
    pub clean_volume_name: Option<Box<dyn Fn(&str) -> String>>,
}

impl Default for UnpackOptions {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("data"),
            clean_volume_name: None,
        }
    }
}

#[derive(Debug, Clone)]
struct ManifestItem {
    id: String,
    href: String,
    media_type: String,
    properties: String,
}

#[derive(Debug, Default)]
struct PackageDoc {
    title: String,
    author: String,
    summary: String,
    tags: Vec<String>,
    manifest: Vec<ManifestItem>,
    spine: Vec<String>,
    toc_id: Option<String>,
    cover_meta: Option<String>,
}

#[derive(Debug, Clone, Default)]
struct TocEntry {
    title: String,
    href: String,
    children: Vec<TocEntry>,
}

pub struct EpubDeconstructor {
    entries: HashMap<String, Vec<u8>>,
    opf_dir: String,
    package: PackageDoc,
    novel_name: String,
    save_dir: PathBuf,
    images_dir: PathBuf,
    options: UnpackOptions,
}

impl EpubDeconstructor {
    pub fn new(epub_path: &Path, options: UnpackOptions) -> Result<Self> {
        info!("reading EPUB: {}", epub_path.display());
        let file = fs::File::open(epub_path)
            .with_context(|| format!("open {}", epub_path.display()))?;
        let mut archive = zip::ZipArchive::new(file).context("read epub archive")?;

        let mut entries = HashMap::with_capacity(archive.len());
        for i in 0..archive.len() {
            let mut entry = archive
                .by_index(i)
                .map_err(|e| anyhow!("zip entry read error: {e}"))?;
            let name = entry.name().to_string();
            let mut data = Vec::new();
            entry.read_to_end(&mut data)?;
            entries.insert(name, data);
        }

        let container = entries
            .get("META-INF/container.xml")
            .ok_or_else(|| anyhow!("missing META-INF/container.xml"))?;
        let opf_path = find_opf_path(&String::from_utf8_lossy(container))?;
        let opf = entries
            .get(&opf_path)
            .ok_or_else(|| anyhow!("missing package document: {opf_path}"))?;
        let package = parse_opf(&String::from_utf8_lossy(opf));

        let novel_name = if package.title.trim().is_empty() {
            "Unknown Novel".to_string()
        } else {
            package.title.trim().to_string()
        };

        let save_dir = options.output_dir.join(format_filename(&novel_name));
        let images_dir = save_dir.join("images");
        fs::create_dir_all(&images_dir)?;
        info!("output directory: {}", save_dir.display());

        Ok(Self {
            entries,
            opf_dir: parent_dir(&opf_path),
            package,
            novel_name,
            save_dir,
            images_dir,
            options,
        })
    }

    pub fn save_dir(&self) -> &Path {
        &self.save_dir
    }

    /// Runs the full re-ingest and returns the canonical base directory.
    pub fn deconstruct(&self) -> Result<PathBuf> {
        info!("deconstructing '{}'", self.novel_name);

        let mut image_map: HashMap<String, String> = HashMap::new();

        let author = if self.package.author.trim().is_empty() {
            "Unknown".to_string()
        } else {
            self.package.author.trim().to_string()
        };
        let cover_path = self.extract_cover(&mut image_map);

        let toc = self.find_toc();
        let spine_hrefs = self.spine_document_hrefs();
        let toc_titles = toc_title_map(&toc);

        let mut definitions: Vec<(String, Vec<String>)> = Vec::new();
        let is_multi_volume = toc.iter().any(|e| !e.children.is_empty());
        if is_multi_volume {
            for entry in toc.iter().filter(|e| !e.children.is_empty()) {
                let name = self.volume_name(&entry.title);
                let mut hrefs = Vec::new();
                for child in &entry.children {
                    if !child.href.is_empty() && !hrefs.contains(&child.href) {
                        hrefs.push(child.href.clone());
                    }
                }
                definitions.push((name, hrefs));
            }
        } else {
            let mut hrefs = Vec::new();
            for entry in &toc {
                if !entry.href.is_empty() && !hrefs.contains(&entry.href) {
                    hrefs.push(entry.href.clone());
                }
            }
            if !hrefs.is_empty() {
                definitions.push((self.novel_name.clone(), hrefs));
            }
        }
        if definitions.is_empty() {
            warn!("TOC yielded no volumes, falling back to spine order");
            definitions.push((self.novel_name.clone(), spine_hrefs.clone()));
        }

        let mut processed: HashSet<String> = HashSet::new();
        let mut descriptors: Vec<VolumeDescriptor> = Vec::new();

        for (name, hrefs) in definitions {
            let vol_slug = format_filename(&name).to_lowercase();

            let mut ordered: Vec<String> = spine_hrefs
                .iter()
                .filter(|h| hrefs.contains(*h) && !processed.contains(*h))
                .cloned()
                .collect();
            if ordered.is_empty() {
                ordered = hrefs
                    .iter()
                    .filter(|h| !processed.contains(*h))
                    .cloned()
                    .collect();
            }
            if ordered.is_empty() {
                continue;
            }

            info!("processing volume: {}", name);
            let mut chapters: Vec<ChapterContent> = Vec::new();
            for (i, href) in ordered.iter().enumerate() {
                let toc_title = toc_titles.get(href).map(|t| t.as_str());
                if let Some(chapter) =
                    self.process_chapter_doc(href, toc_title, &vol_slug, i, &mut image_map)
                {
                    chapters.push(chapter);
                }
                processed.insert(href.clone());
            }
            if chapters.is_empty() {
                continue;
            }

            // Renumber contiguously now that skipped pages are gone.
            for (i, chapter) in chapters.iter_mut().enumerate() {
                chapter.index = i;
            }

            let filename = format!("{}.json", format_filename(&name));
            let record = VolumeRecord {
                volume_name: name.clone(),
                volume_url: String::new(),
                cover_image_local: String::new(),
                chapters,
            };
            let path = self.save_dir.join(&filename);
            fs::write(&path, serde_json::to_string_pretty(&record)?)
                .with_context(|| format!("write {}", path.display()))?;
            info!("saved volume data to {}", path.display());

            descriptors.push(VolumeDescriptor {
                order: descriptors.len() + 1,
                name,
                filename,
                url: String::new(),
            });
        }

        let metadata = NovelRecord {
            novel_name: self.novel_name.clone(),
            author,
            tags: self.package.tags.clone(),
            summary: self.package.summary.clone(),
            cover_image_local: cover_path,
            url: String::new(),
            volumes: descriptors,
        };
        let meta_path = self.save_dir.join("metadata.json");
        fs::write(&meta_path, serde_json::to_string_pretty(&metadata)?)
            .with_context(|| format!("write {}", meta_path.display()))?;
        info!("saved metadata to {}", meta_path.display());

        if let Some(folder) = self.save_dir.file_name().and_then(|n| n.to_str()) {
            book_list::add_book(Path::new(BOOKS_FILE), folder);
        }

        Ok(self.save_dir.clone())
    }

    fn volume_name(&self, title: &str) -> String {
        match &self.options.clean_volume_name {
            Some(clean) => {
                let cleaned = clean(title);
                if cleaned.trim().is_empty() {
                    title.to_string()
                } else {
                    cleaned
                }
            }
            None => title.to_string(),
        }
    }

    /// Documents referenced by the spine, in spine order, as hrefs
    /// relative to the package document.
    fn spine_document_hrefs(&self) -> Vec<String> {
        let mut hrefs = Vec::new();
        for idref in &self.package.spine {
            if let Some(item) = self.package.manifest.iter().find(|i| i.id == *idref) {
                if item.media_type == "application/xhtml+xml" {
                    hrefs.push(item.href.clone());
                }
            }
        }
        hrefs
    }

    /// Navigation document first (xhtml manifest item whose href contains
    /// `nav`), NCX referenced by the spine's `toc` attribute second.
    fn find_toc(&self) -> Vec<TocEntry> {
        if let Some(item) = self
            .package
            .manifest
            .iter()
            .find(|i| i.media_type == "application/xhtml+xml" && i.href.contains("nav"))
        {
            if let Some((_, bytes)) = self.lookup(&item.href) {
                let base = parent_dir(&item.href);
                return parse_nav(&String::from_utf8_lossy(bytes), &base);
            }
        }

        if let Some(toc_id) = &self.package.toc_id {
            if let Some(item) = self.package.manifest.iter().find(|i| i.id == *toc_id) {
                if let Some((_, bytes)) = self.lookup(&item.href) {
                    let base = parent_dir(&item.href);
                    return parse_ncx(&String::from_utf8_lossy(bytes), &base);
                }
            }
        }

        Vec::new()
    }

    /// Resolves a package-relative path to archive bytes, trying the
    /// package base first and the bare path second.
    fn lookup(&self, rel_to_opf: &str) -> Option<(String, &[u8])> {
        let resolved = join_path(&self.opf_dir, rel_to_opf);
        if let Some(bytes) = self.entries.get(&resolved) {
            return Some((resolved, bytes.as_slice()));
        }
        self.entries
            .get(rel_to_opf)
            .map(|bytes| (rel_to_opf.to_string(), bytes.as_slice()))
    }

    fn cover_item(&self) -> Option<&ManifestItem> {
        if let Some(cover_id) = &self.package.cover_meta {
            if let Some(item) = self.package.manifest.iter().find(|i| i.id == *cover_id) {
                return Some(item);
            }
        }
        self.package
            .manifest
            .iter()
            .find(|i| i.properties.contains("cover-image"))
    }

    fn extract_cover(&self, image_map: &mut HashMap<String, String>) -> String {
        let Some(item) = self.cover_item() else {
            warn!("could not find a cover image");
            return String::new();
        };
        let Some((_, bytes)) = self.lookup(&item.href) else {
            warn!("cover item {} has no archive entry", item.href);
            return String::new();
        };

        let ext = image_extension(&item.href);
        let filename = format!("main_cover.{ext}");
        let target = self.images_dir.join(&filename);
        if let Err(e) = fs::write(&target, bytes) {
            warn!("could not save cover: {}", e);
            return String::new();
        }
        let local = format!("images/{filename}");
        image_map.insert(item.href.clone(), local.clone());
        info!("using cover image: {}", local);
        local
    }

    /// One spine document into a materialized chapter. `None` drops the
    /// page (cover/TOC heuristics) or marks it unreadable.
    fn process_chapter_doc(
        &self,
        href: &str,
        toc_title: Option<&str>,
        vol_slug: &str,
        index: usize,
        image_map: &mut HashMap<String, String>,
    ) -> Option<ChapterContent> {
        let (_, bytes) = self.lookup(href)?;
        let raw = String::from_utf8_lossy(bytes).into_owned();
        let mut doc = Html::parse_document(&raw);

        let title = toc_title
            .map(str::to_string)
            .filter(|t| !t.trim().is_empty())
            .or_else(|| {
                doc.select(sel_heading())
                    .next()
                    .map(|h| h.text().collect::<String>().trim().to_string())
                    .filter(|t| !t.is_empty())
            })
            .unwrap_or_else(|| format!("Chapter {}", index + 1));

        let text_len: usize = doc
            .root_element()
            .text()
            .map(|t| t.trim().chars().count())
            .sum();
        let lower_title = title.to_lowercase();
        if text_len < 100 && lower_title.contains("cover") {
            info!("skipping likely cover page: '{}'", title);
            return None;
        }
        if text_len < 50
            && ["toc", "contents", "mục lục"]
                .iter()
                .any(|t| lower_title.contains(t))
        {
            info!("skipping likely ToC page: '{}'", title);
            return None;
        }

        self.localize_images(&mut doc, href, vol_slug, index, image_map);

        let body = match doc.select(sel_body()).next() {
            Some(body) => body.inner_html(),
            None => doc.root_element().html(),
        };

        let slug = format!("{vol_slug}_chap_{index}");
        let content = html_utils::clean_html(&html_utils::process_footnotes(&body, &slug));

        Some(ChapterContent {
            title,
            url: String::new(),
            content,
            index,
        })
    }

    /// Rewrites chapter images to deterministic local files, resolving
    /// each `src` against the chapter directory, then the bare path, then
    /// by basename among manifest image items.
    fn localize_images(
        &self,
        doc: &mut Html,
        chapter_href: &str,
        vol_slug: &str,
        chapter_index: usize,
        image_map: &mut HashMap<String, String>,
    ) {
        let chapter_dir = parent_dir(chapter_href);
        let imgs: Vec<_> = doc.select(sel_img()).map(|e| e.id()).collect();

        for (m, id) in imgs.into_iter().enumerate() {
            let src = doc
                .tree
                .get(id)
                .and_then(ElementRef::wrap)
                .and_then(|el| el.value().attr("src"))
                .unwrap_or_default()
                .to_string();
            if src.is_empty() {
                detach(doc, id);
                continue;
            }

            let resolved = join_path(&chapter_dir, src.split('#').next().unwrap_or(&src));
            if let Some(local) = image_map.get(&resolved) {
                set_img_src(doc, id, local);
                continue;
            }

            let located = self
                .lookup(&resolved)
                .or_else(|| self.find_by_basename(&resolved));
            let Some((name, bytes)) = located else {
                warn!(
                    "could not find image for src {} in {}, dropping",
                    src, chapter_href
                );
                detach(doc, id);
                continue;
            };

            let ext = image_extension(&name);
            let filename = format!("{vol_slug}_chap_{chapter_index}_img_{m}.{ext}");
            let target = self.images_dir.join(&filename);
            if let Err(e) = fs::write(&target, bytes) {
                warn!("failed to save image {}: {}", name, e);
                detach(doc, id);
                continue;
            }

            let local = format!("images/{filename}");
            set_img_src(doc, id, &local);
            image_map.insert(resolved, local);
        }
    }

    fn find_by_basename(&self, resolved: &str) -> Option<(String, &[u8])> {
        let wanted = basename(resolved);
        for item in &self.package.manifest {
            if item.media_type.starts_with("image/") && basename(&item.href) == wanted {
                if let Some(found) = self.lookup(&item.href) {
                    return Some(found);
                }
            }
        }
        None
    }
}

fn detach(doc: &mut Html, id: NodeId) {
    if let Some(mut node) = doc.tree.get_mut(id) {
        node.detach();
    }
}

fn set_img_src(doc: &mut Html, id: NodeId, local: &str) {
    if let Some(mut node) = doc.tree.get_mut(id) {
        if let scraper::Node::Element(el) = node.value() {
            for (key, value) in el.attrs.iter_mut() {
                if key.local.as_ref() == "src" {
                    *value = local.to_string().into();
                }
            }
        }
    }
}

fn toc_title_map(entries: &[TocEntry]) -> HashMap<String, String> {
    fn walk(entries: &[TocEntry], map: &mut HashMap<String, String>) {
        for entry in entries {
            if !entry.href.is_empty() {
                map.entry(entry.href.clone())
                    .or_insert_with(|| entry.title.clone());
            }
            walk(&entry.children, map);
        }
    }
    let mut map = HashMap::new();
    walk(entries, &mut map);
    map
}

fn find_opf_path(xml: &str) -> Result<String> {
    let mut reader = Reader::from_str(xml);
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Empty(e)) | Ok(Event::Start(e)) => {
                if e.local_name().as_ref() == b"rootfile" {
                    for attr in e.attributes().flatten() {
                        if attr.key.local_name().as_ref() == b"full-path" {
                            return Ok(String::from_utf8_lossy(&attr.value).to_string());
                        }
                    }
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(anyhow!("container.xml parse error: {e}")),
            _ => {}
        }
        buf.clear();
    }
    Err(anyhow!("could not find package document in container.xml"))
}

fn parse_opf(xml: &str) -> PackageDoc {
    let mut reader = Reader::from_str(xml);
    let mut buf = Vec::new();
    let mut package = PackageDoc::default();

    let mut in_title = false;
    let mut in_creator = false;
    let mut in_description = false;
    let mut in_subject = false;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"title" => in_title = true,
                b"creator" => in_creator = true,
                b"description" => in_description = true,
                b"subject" => {
                    in_subject = true;
                    package.tags.push(String::new());
                }
                b"spine" => {
                    for attr in e.attributes().flatten() {
                        if attr.key.local_name().as_ref() == b"toc" {
                            package.toc_id =
                                Some(String::from_utf8_lossy(&attr.value).to_string());
                        }
                    }
                }
                b"item" => read_manifest_item(&e, &mut package),
                b"itemref" => read_spine_ref(&e, &mut package),
                b"meta" => read_meta(&e, &mut package),
                _ => {}
            },
            Ok(Event::Empty(e)) => match e.local_name().as_ref() {
                b"item" => read_manifest_item(&e, &mut package),
                b"itemref" => read_spine_ref(&e, &mut package),
                b"meta" => read_meta(&e, &mut package),
                _ => {}
            },
            Ok(Event::Text(e)) => {
                let text = e.unescape().unwrap_or_default().into_owned();
                if in_title {
                    package.title.push_str(&text);
                } else if in_creator {
                    package.author.push_str(&text);
                } else if in_description {
                    package.summary.push_str(&text);
                } else if in_subject {
                    if let Some(last) = package.tags.last_mut() {
                        last.push_str(&text);
                    }
                }
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"title" => in_title = false,
                b"creator" => in_creator = false,
                b"description" => in_description = false,
                b"subject" => in_subject = false,
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(_) => break,
            _ => {}
        }
        buf.clear();
    }

    package.tags.retain(|t| !t.trim().is_empty());
    for tag in &mut package.tags {
        *tag = tag.trim().to_string();
    }
    package
}

fn read_manifest_item(e: &quick_xml::events::BytesStart<'_>, package: &mut PackageDoc) {
    let mut item = ManifestItem {
        id: String::new(),
        href: String::new(),
        media_type: String::new(),
        properties: String::new(),
    };
    for attr in e.attributes().flatten() {
        let value = String::from_utf8_lossy(&attr.value).to_string();
        match attr.key.local_name().as_ref() {
            b"id" => item.id = value,
            b"href" => item.href = value,
            b"media-type" => item.media_type = value,
            b"properties" => item.properties = value,
            _ => {}
        }
    }
    if !item.href.is_empty() {
        package.manifest.push(item);
    }
}

fn read_spine_ref(e: &quick_xml::events::BytesStart<'_>, package: &mut PackageDoc) {
    for attr in e.attributes().flatten() {
        if attr.key.local_name().as_ref() == b"idref" {
            package
                .spine
                .push(String::from_utf8_lossy(&attr.value).to_string());
        }
    }
}

fn read_meta(e: &quick_xml::events::BytesStart<'_>, package: &mut PackageDoc) {
    let mut name = String::new();
    let mut content = String::new();
    for attr in e.attributes().flatten() {
        let value = String::from_utf8_lossy(&attr.value).to_string();
        match attr.key.local_name().as_ref() {
            b"name" => name = value,
            b"content" => content = value,
            _ => {}
        }
    }
    if name == "cover" && !content.is_empty() {
        package.cover_meta = Some(content);
    }
}

/// Nested `<ol><li><a>` lists of an EPUB 3 navigation document.
fn parse_nav(html: &str, base: &str) -> Vec<TocEntry> {
    let doc = Html::parse_document(html);
    let Some(nav) = doc.select(sel_nav()).next() else {
        return Vec::new();
    };
    let Some(ol) = direct_child(nav, "ol").or_else(|| nav.select(sel_ol()).next()) else {
        return Vec::new();
    };
    parse_nav_list(ol, base)
}

fn parse_nav_list(ol: ElementRef<'_>, base: &str) -> Vec<TocEntry> {
    let mut out = Vec::new();
    for li in ol
        .children()
        .filter_map(ElementRef::wrap)
        .filter(|e| e.value().name() == "li")
    {
        let mut entry = TocEntry::default();
        for child in li.children().filter_map(ElementRef::wrap) {
            match child.value().name() {
                "a" | "span" => {
                    if entry.title.is_empty() {
                        entry.title = child.text().collect::<String>().trim().to_string();
                    }
                    if entry.href.is_empty() {
                        if let Some(href) = child.value().attr("href") {
                            let href = href.split('#').next().unwrap_or("");
                            if !href.is_empty() {
                                entry.href = join_path(base, href);
                            }
                        }
                    }
                }
                "ol" => entry.children.extend(parse_nav_list(child, base)),
                _ => {}
            }
        }
        if !entry.title.is_empty() || !entry.href.is_empty() || !entry.children.is_empty() {
            out.push(entry);
        }
    }
    out
}

fn direct_child<'a>(el: ElementRef<'a>, name: &str) -> Option<ElementRef<'a>> {
    el.children()
        .filter_map(ElementRef::wrap)
        .find(|c| c.value().name() == name)
}

/// `<navPoint>` tree of an NCX table of contents.
fn parse_ncx(xml: &str, base: &str) -> Vec<TocEntry> {
    let mut reader = Reader::from_str(xml);
    let mut buf = Vec::new();
    let mut roots: Vec<TocEntry> = Vec::new();
    let mut stack: Vec<TocEntry> = Vec::new();
    let mut in_text = false;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"navPoint" => stack.push(TocEntry::default()),
                b"text" => in_text = true,
                b"content" => ncx_content(&e, base, &mut stack),
                _ => {}
            },
            Ok(Event::Empty(e)) => {
                if e.local_name().as_ref() == b"content" {
                    ncx_content(&e, base, &mut stack);
                }
            }
            Ok(Event::Text(e)) => {
                if in_text {
                    if let Some(top) = stack.last_mut() {
                        if top.title.is_empty() {
                            top.title =
                                e.unescape().unwrap_or_default().trim().to_string();
                        }
                    }
                }
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"navPoint" => {
                    if let Some(done) = stack.pop() {
                        match stack.last_mut() {
                            Some(parent) => parent.children.push(done),
                            None => roots.push(done),
                        }
                    }
                }
                b"text" => in_text = false,
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(_) => break,
            _ => {}
        }
        buf.clear();
    }
    roots
}

fn ncx_content(e: &quick_xml::events::BytesStart<'_>, base: &str, stack: &mut [TocEntry]) {
    let Some(top) = stack.last_mut() else {
        return;
    };
    for attr in e.attributes().flatten() {
        if attr.key.local_name().as_ref() == b"src" {
            let src = String::from_utf8_lossy(&attr.value).to_string();
            let src = src.split('#').next().unwrap_or("");
            if !src.is_empty() {
                top.href = join_path(base, src);
            }
        }
    }
}

fn image_extension(path: &str) -> String {
    let ext = basename(path)
        .rsplit('.')
        .next()
        .unwrap_or("")
        .to_ascii_lowercase();
    if IMAGE_EXTS.contains(&ext.as_str()) {
        ext
    } else {
        "jpeg".to_string()
    }
}

fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

fn parent_dir(path: &str) -> String {
    match path.rfind('/') {
        Some(i) => path[..i].to_string(),
        None => String::new(),
    }
}

/// Joins and normalizes slash-separated archive paths (`.`/`..` aware).
fn join_path(base: &str, rel: &str) -> String {
    let mut parts: Vec<&str> = if base.is_empty() {
        Vec::new()
    } else {
        base.split('/').collect()
    };
    for segment in rel.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            s => parts.push(s),
        }
    }
    parts.join("/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_join_normalizes_dots() {
        assert_eq!(join_path("OEBPS", "images/a.jpg"), "OEBPS/images/a.jpg");
        assert_eq!(join_path("OEBPS/text", "../images/a.jpg"), "OEBPS/images/a.jpg");
        assert_eq!(join_path("", "./a.xhtml"), "a.xhtml");
        assert_eq!(join_path("a/b", "c"), "a/b/c");
    }

    #[test]
    fn image_extension_whitelists_known_types() {
        assert_eq!(image_extension("images/x.PNG"), "png");
        assert_eq!(image_extension("images/x.svg"), "jpeg");
        assert_eq!(image_extension("noext"), "jpeg");
    }

    #[test]
    fn container_xml_reveals_opf() {
        let xml = r#"<?xml version="1.0"?>
            <container version="1.0" xmlns="urn:oasis:names:tc:opendocument:xmlns:container">
              <rootfiles>
                <rootfile full-path="OEBPS/content.opf" media-type="application/oebps-package+xml"/>
              </rootfiles>
            </container>"#;
        assert_eq!(find_opf_path(xml).unwrap(), "OEBPS/content.opf");
    }

    #[test]
    fn opf_metadata_and_manifest_parse() {
        let xml = r#"<?xml version="1.0"?>
        <package xmlns="http://www.idpf.org/2007/opf" version="3.0">
          <metadata xmlns:dc="http://purl.org/dc/elements/1.1/">
            <dc:title>Truyện</dc:title>
            <dc:creator>Tác giả X</dc:creator>
            <dc:description>tóm tắt</dc:description>
            <dc:subject>Action</dc:subject>
            <dc:subject>Drama</dc:subject>
            <meta name="cover" content="cover-img"/>
          </metadata>
          <manifest>
            <item id="cover-img" href="images/cover.jpg" media-type="image/jpeg"/>
            <item id="nav" href="nav.xhtml" media-type="application/xhtml+xml" properties="nav"/>
            <item id="c1" href="c1.xhtml" media-type="application/xhtml+xml"/>
          </manifest>
          <spine toc="ncx">
            <itemref idref="c1"/>
          </spine>
        </package>"#;
        let package = parse_opf(xml);
        assert_eq!(package.title, "Truyện");
        assert_eq!(package.author, "Tác giả X");
        assert_eq!(package.summary, "tóm tắt");
        assert_eq!(package.tags, vec!["Action".to_string(), "Drama".to_string()]);
        assert_eq!(package.manifest.len(), 3);
        assert_eq!(package.spine, vec!["c1".to_string()]);
        assert_eq!(package.toc_id.as_deref(), Some("ncx"));
        assert_eq!(package.cover_meta.as_deref(), Some("cover-img"));
    }

    #[test]
    fn nav_parses_nested_volumes() {
        let html = r#"<html xmlns:epub="http://www.idpf.org/2007/ops"><body>
          <nav epub:type="toc"><ol>
            <li><a href="intro.xhtml">Giới thiệu</a></li>
            <li><a href="vol_0.xhtml#top">Tập 1</a>
              <ol>
                <li><a href="v0_c0.xhtml">C1</a></li>
                <li><a href="v0_c1.xhtml">C2</a></li>
              </ol>
            </li>
          </ol></nav>
        </body></html>"#;
        let toc = parse_nav(html, "");
        assert_eq!(toc.len(), 2);
        assert_eq!(toc[0].title, "Giới thiệu");
        assert!(toc[0].children.is_empty());
        assert_eq!(toc[1].title, "Tập 1");
        assert_eq!(toc[1].href, "vol_0.xhtml");
        assert_eq!(toc[1].children.len(), 2);
        assert_eq!(toc[1].children[0].href, "v0_c0.xhtml");
    }

    #[test]
    fn ncx_parses_navpoint_tree() {
        let xml = r#"<?xml version="1.0"?>
        <ncx xmlns="http://www.daisy.org/z3986/2005/ncx/" version="2005-1">
          <navMap>
            <navPoint id="p1"><navLabel><text>Tập 1</text></navLabel><content src="vol_0.xhtml"/>
              <navPoint id="p2"><navLabel><text>C1</text></navLabel><content src="v0_c0.xhtml#x"/></navPoint>
            </navPoint>
          </navMap>
        </ncx>"#;
        let toc = parse_ncx(xml, "");
        assert_eq!(toc.len(), 1);
        assert_eq!(toc[0].title, "Tập 1");
        assert_eq!(toc[0].children.len(), 1);
        assert_eq!(toc[0].children[0].href, "v0_c0.xhtml");
    }
}
