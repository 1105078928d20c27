//! Persisted record shapes: `metadata.json` and per-volume records.

use serde::{Deserialize, Serialize};

/// A chapter whose body has been fetched, cleaned and persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChapterContent {
    pub title: String,
    pub url: String,
    pub content: String,
    pub index: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeRecord {
    pub volume_name: String,
    #[serde(default)]
    pub volume_url: String,
    #[serde(default)]
    pub cover_image_local: String,
    #[serde(default)]
    pub chapters: Vec<ChapterContent>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeDescriptor {
    /// Dense 1-based position following source order.
    pub order: usize,
    pub name: String,
    pub filename: String,
    #[serde(default)]
    pub url: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NovelRecord {
    pub novel_name: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub cover_image_local: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub volumes: Vec<VolumeDescriptor>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_use_camel_case_fields() {
        let record = NovelRecord {
            novel_name: "N".to_string(),
            author: "A".to_string(),
            tags: vec!["t".to_string()],
            summary: "s".to_string(),
            cover_image_local: "images/main_cover.jpg".to_string(),
            url: "https://docln.net/truyen/5".to_string(),
            volumes: vec![VolumeDescriptor {
                order: 1,
                name: "V".to_string(),
                filename: "V.json".to_string(),
                url: String::new(),
            }],
        };
        let json = serde_json::to_string_pretty(&record).unwrap();
        for field in [
            "novelName",
            "coverImageLocal",
            "tags",
            "summary",
            "volumes",
            "order",
            "filename",
        ] {
            assert!(json.contains(&format!("\"{field}\"")), "missing {field}");
        }
        let back: NovelRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn volume_record_round_trips() {
        let record = VolumeRecord {
            volume_name: "Tập 1".to_string(),
            volume_url: "https://docln.net/t/5/tap-1".to_string(),
            cover_image_local: "images/vol_cover_Tập_1.jpg".to_string(),
            chapters: vec![ChapterContent {
                title: "C1".to_string(),
                url: "https://docln.net/t/5/c1".to_string(),
                content: "<p>body</p>".to_string(),
                index: 0,
            }],
        };
        let json = serde_json::to_string_pretty(&record).unwrap();
        assert!(json.contains("\"volumeName\""));
        assert!(json.contains("\"volumeUrl\""));
        let back: VolumeRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);
    }
}
