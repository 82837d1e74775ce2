//! Control surface of the SQL extractor and the articles it produces.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::envelope::{FieldError, Payload};
use crate::register_payload;

/// Extraction job kinds. The first three stream changes, the last two replay an interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SqlExtractionFunc {
    New,
    Updated,
    Deleted,
    Reindex,
    Clean,
}

impl SqlExtractionFunc {
    pub fn is_streaming(self) -> bool {
        matches!(self, Self::New | Self::Updated | Self::Deleted)
    }

    pub fn is_interval(self) -> bool {
        matches!(self, Self::Reindex | Self::Clean)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StartSqlExtraction {
    pub func: SqlExtractionFunc,
    pub last_article_id: i64,
    /// Pause between iterations, in milliseconds
    pub iteration_timeout: u64,
    pub batch_size: u32,
    pub queue_name: String,
}

impl Payload for StartSqlExtraction {
    const TAG: &'static str = "StartSqlExtractionRequest";

    fn validate(&self) -> Vec<FieldError> {
        let mut errors = Vec::new();
        if !self.func.is_streaming() {
            errors.push(FieldError::new("Func", "must be New, Updated or Deleted"));
        }
        if self.last_article_id < 0 {
            errors.push(FieldError::new("LastArticleId", "cannot be negative"));
        }
        errors
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StopSqlExtraction {
    pub func: SqlExtractionFunc,
}

impl Payload for StopSqlExtraction {
    const TAG: &'static str = "StopSqlExtractionRequest";
}

/// Replays the article id range `from..=to`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct IntervalRequest {
    pub func: SqlExtractionFunc,
    pub from: i64,
    pub to: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue: Option<String>,
}

impl Payload for IntervalRequest {
    const TAG: &'static str = "IntervalRequest";

    fn validate(&self) -> Vec<FieldError> {
        let mut errors = Vec::new();
        if !self.func.is_interval() {
            errors.push(FieldError::new("Func", "must be Reindex or Clean"));
        }
        if self.from > self.to {
            errors.push(FieldError::message("From must not exceed To"));
        }
        errors
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ProgressRequest {
    pub date_time: DateTime<Utc>,
}

impl Payload for ProgressRequest {
    const TAG: &'static str = "ProgressRequest";
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ProgressResponse {
    pub new_article_progress: bool,
    pub modified_article_progress: bool,
    pub deleted_article_progress: bool,
}

impl Payload for ProgressResponse {
    const TAG: &'static str = "ProgressResponse";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct FuncStatusRequest {
    pub date_time: DateTime<Utc>,
}

impl Payload for FuncStatusRequest {
    const TAG: &'static str = "FuncStatusRequest";
}

/// Which extraction jobs are running.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct FuncStateResponse {
    pub new_state: bool,
    pub modified_state: bool,
    pub deleted_state: bool,
    pub reindex_state: bool,
    pub clean_state: bool,
    pub last_article_id: i64,
}

impl Payload for FuncStateResponse {
    const TAG: &'static str = "FuncStateResponse";
}

/// Acknowledges a start or stop request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SqlExtractionResponse {
    pub date_time: DateTime<Utc>,
}

impl Payload for SqlExtractionResponse {
    const TAG: &'static str = "SqlExtractionResponse";
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SourceModel {
    pub id: i64,
    pub title: String,
    pub site: String,
}

/// Work queue item carrying one extracted article.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ArticleModel {
    pub id: i64,
    pub title: String,
    pub pub_date: DateTime<Utc>,
    pub created: DateTime<Utc>,
    pub source_id: i64,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub link: Option<String>,
    pub source: SourceModel,
}

impl Payload for ArticleModel {
    const TAG: &'static str = "ArticleModel";
}

/// Work queue item listing articles removed at the source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DeletedArticles {
    pub article_id: Vec<i64>,
}

impl Payload for DeletedArticles {
    const TAG: &'static str = "DeletedArticleModel";
}

register_payload!(StartSqlExtraction);
register_payload!(StopSqlExtraction);
register_payload!(IntervalRequest);
register_payload!(ProgressRequest);
register_payload!(ProgressResponse);
register_payload!(FuncStatusRequest);
register_payload!(FuncStateResponse);
register_payload!(SqlExtractionResponse);
register_payload!(ArticleModel);
register_payload!(DeletedArticles);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::Envelope;

    fn start(func: SqlExtractionFunc, last_article_id: i64) -> StartSqlExtraction {
        StartSqlExtraction {
            func,
            last_article_id,
            iteration_timeout: 1000,
            batch_size: 100,
            queue_name: "articles".into(),
        }
    }

    #[test]
    fn test_start_validation() {
        assert!(start(SqlExtractionFunc::New, 0).validate().is_empty());
        let errors = start(SqlExtractionFunc::Reindex, -1).validate();
        let fields: Vec<_> = errors.iter().filter_map(|e| e.field.as_deref()).collect();
        assert_eq!(fields, vec!["Func", "LastArticleId"]);
    }

    #[test]
    fn test_interval_validation() {
        let mut request = IntervalRequest {
            func: SqlExtractionFunc::Clean,
            from: 10,
            to: 20,
            queue: None,
        };
        assert!(request.validate().is_empty());
        request.from = 30;
        request.func = SqlExtractionFunc::Deleted;
        assert_eq!(request.validate().len(), 2);
    }

    #[test]
    fn test_article_wire_shape() {
        let article = ArticleModel {
            id: 7,
            title: "Title".into(),
            pub_date: Utc::now(),
            created: Utc::now(),
            source_id: 1,
            body: None,
            link: Some("https://example.org/7".into()),
            source: SourceModel {
                id: 1,
                title: "Example".into(),
                site: "example.org".into(),
            },
        };
        let bytes = Envelope::new(article).to_bytes().unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["Type"], "ArticleModel");
        assert_eq!(value["Payload"]["SourceId"], 1);
        assert_eq!(value["Payload"]["Source"]["Site"], "example.org");
    }
}
