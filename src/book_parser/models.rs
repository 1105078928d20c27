//! Catalog model: a parsed novel landing page.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChapterRef {
    pub name: String,
    pub url: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Volume {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub cover_img: String,
    #[serde(default)]
    pub chapters: Vec<ChapterRef>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Novel {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub main_cover: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub volumes: Vec<Volume>,
}

impl Novel {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    pub fn from_json(raw: &str) -> serde_json::Result<Self> {
        serde_json::from_str(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Novel {
        Novel {
            name: "T".to_string(),
            url: "https://docln.net/truyen/5".to_string(),
            author: "A".to_string(),
            summary: "<p>intro</p>".to_string(),
            main_cover: "https://i.hako.vip/c.jpg".to_string(),
            tags: vec!["Action".to_string(), "Fantasy".to_string()],
            volumes: vec![Volume {
                url: "https://docln.net/truyen/5#vol1".to_string(),
                name: "Tập 1".to_string(),
                cover_img: "https://i.hako.vip/v1.jpg".to_string(),
                chapters: vec![ChapterRef {
                    name: "Chương 1".to_string(),
                    url: "https://docln.net/truyen/5/chuong-1".to_string(),
                }],
            }],
        }
    }

    #[test]
    fn serialization_round_trips() {
        let novel = sample();
        let json = novel.to_json().unwrap();
        let back = Novel::from_json(&json).unwrap();
        assert_eq!(back, novel);
        assert_eq!(back.to_json().unwrap(), json);
    }

    #[test]
    fn serialized_fields_are_camel_case() {
        let json = sample().to_json().unwrap();
        assert!(json.contains("\"mainCover\""));
        assert!(json.contains("\"coverImg\""));
        assert!(json.contains("\"volumes\""));
    }

    #[test]
    fn missing_optional_fields_default() {
        let novel =
            Novel::from_json(r#"{"name":"T","url":"https://docln.net/truyen/5"}"#).unwrap();
        assert!(novel.author.is_empty());
        assert!(novel.tags.is_empty());
        assert!(novel.volumes.is_empty());
    }

    #[test]
    fn chapters_require_name_and_url() {
        let raw = r#"{"name":"T","url":"u","volumes":[{"chapters":[{"name":"c1"}]}]}"#;
        assert!(Novel::from_json(raw).is_err());
    }
}
