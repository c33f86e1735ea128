use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

/// Whether the submitted asset is a still image or a video clip.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum MediaKind {
    Image,
    Video,
}

impl MediaKind {
    pub fn from_content_type(content_type: &str) -> Option<Self> {
        match content_type.split('/').next() {
            Some("image") => Some(MediaKind::Image),
            Some("video") => Some(MediaKind::Video),
            _ => None,
        }
    }
}

/// Meal-level totals.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct NutritionSummary {
    pub total_food_volume_ml: f64,
    pub total_mass_g: f64,
    pub total_calories_kcal: f64,
    pub num_food_items: u32,
}

/// One food item found in the media.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DetectedItem {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_ml: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mass_g: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub calories_kcal: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FoodBrief {
    pub name: String,
    pub calories_kcal: Option<f64>,
}

/// Lightweight copy of the result kept on the job row, so simple clients
/// never need to fetch the full document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResultSummary {
    pub nutrition: NutritionSummary,
    pub detected_foods: Vec<FoodBrief>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcessingInfo {
    pub analyzer: String,
    pub input_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frames_processed: Option<u32>,
}

/// The result document written once to the object store by the worker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AnalysisResult {
    pub job_id: Uuid,
    pub media_type: MediaKind,
    pub detected_items: Vec<DetectedItem>,
    pub meal_summary: NutritionSummary,
    pub processing_info: ProcessingInfo,
}

impl AnalysisResult {
    pub fn summary(&self) -> ResultSummary {
        ResultSummary {
            nutrition: self.meal_summary.clone(),
            detected_foods: self
                .detected_items
                .iter()
                .map(|item| FoodBrief {
                    name: item.name.clone(),
                    calories_kcal: item.calories_kcal,
                })
                .collect(),
        }
    }
}
