// src/classifier.rs - Nutrient thresholds and treatment advice
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::models::{SoilTest, SoilTestStatus, Tone};

// ==================== READINGS ====================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PhClass {
    Acidic,
    Optimal,
    Alkaline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum NutrientLevel {
    Low,
    Medium,
    High,
}

impl PhClass {
    pub fn tone(&self) -> Tone {
        match self {
            PhClass::Acidic => Tone::Warning,
            PhClass::Alkaline => Tone::Caution,
            PhClass::Optimal => Tone::Good,
        }
    }
}

impl NutrientLevel {
    pub fn tone(&self) -> Tone {
        match self {
            NutrientLevel::Low => Tone::Warning,
            NutrientLevel::Medium => Tone::Caution,
            NutrientLevel::High => Tone::Good,
        }
    }
}

pub fn classify_ph(ph: f64) -> PhClass {
    if ph < 6.0 {
        PhClass::Acidic
    } else if ph > 7.5 {
        PhClass::Alkaline
    } else {
        PhClass::Optimal
    }
}

fn level(value: f64, low_below: f64, medium_below: f64) -> NutrientLevel {
    if value < low_below {
        NutrientLevel::Low
    } else if value < medium_below {
        NutrientLevel::Medium
    } else {
        NutrientLevel::High
    }
}

pub fn classify_nitrogen(value: f64) -> NutrientLevel {
    level(value, 40.0, 80.0)
}

pub fn classify_phosphorus(value: f64) -> NutrientLevel {
    level(value, 20.0, 40.0)
}

pub fn classify_potassium(value: f64) -> NutrientLevel {
    level(value, 150.0, 250.0)
}

#[derive(Debug, Clone, Serialize)]
pub struct Reading {
    pub nutrient: &'static str,
    pub value: f64,
    pub label: String,
    pub tone: Tone,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusPresentation {
    pub status: SoilTestStatus,
    pub label: &'static str,
    pub tone: Tone,
}

impl From<SoilTestStatus> for StatusPresentation {
    fn from(status: SoilTestStatus) -> Self {
        Self {
            status,
            label: status.label(),
            tone: status.tone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Interpretation {
    pub soil_test_id: String,
    pub status: StatusPresentation,
    pub readings: Vec<Reading>,
}

/// Labels every reading present on the test. Missing readings are skipped.
pub fn interpret(test: &SoilTest) -> Interpretation {
    let mut readings = Vec::new();

    if let Some(ph) = test.ph_level {
        let class = classify_ph(ph);
        readings.push(Reading { nutrient: "ph", value: ph, label: format!("{:?}", class), tone: class.tone() });
    }
    let nutrients: [(&'static str, Option<f64>, fn(f64) -> NutrientLevel); 3] = [
        ("nitrogen", test.nitrogen_level, classify_nitrogen),
        ("phosphorus", test.phosphorus_level, classify_phosphorus),
        ("potassium", test.potassium_level, classify_potassium),
    ];
    for (nutrient, value, classify) in nutrients {
        if let Some(value) = value {
            let level = classify(value);
            readings.push(Reading { nutrient, value, label: format!("{:?}", level), tone: level.tone() });
        }
    }

    Interpretation {
        soil_test_id: test.id.clone(),
        status: test.status.into(),
        readings,
    }
}

// ==================== TREATMENT PLANS ====================

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct TreatmentPlanRequest {
    #[validate(length(min = 1, max = 100, message = "Crop is required"))]
    pub crop: String,
    #[validate(range(min = 0.0, message = "Nitrogen cannot be negative"))]
    pub nitrogen: f64,
    #[validate(range(min = 0.0, message = "Phosphorus cannot be negative"))]
    pub phosphorus: f64,
    #[validate(range(min = 0.0, message = "Potassium cannot be negative"))]
    pub potassium: f64,
    #[validate(range(min = 0.0, max = 14.0, message = "pH must be between 0 and 14"))]
    pub ph: f64,
    #[validate(range(min = 0.0, max = 100.0, message = "Moisture must be between 0 and 100"))]
    pub moisture: f64,
    #[validate(range(min = 0.0, max = 100.0, message = "Organic matter must be between 0 and 100"))]
    pub organic_matter: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GrowingTips {
    pub sowing_time: String,
    pub irrigation: String,
    pub pest_control: String,
    pub fertilizer: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TreatmentPlan {
    pub crop: String,
    pub suitable: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tips: Option<GrowingTips>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub treatment_suggestions: Vec<String>,
}

fn within(value: f64, min: f64, max: f64) -> bool {
    value >= min && value <= max
}

/// A crop's own rule can widen the general pH 5.5-7.0 window, never narrow it.
pub fn is_suitable(crop: &str, soil: &TreatmentPlanRequest) -> bool {
    let crop_rule = match crop {
        "Rice" => soil.moisture > 60.0 && within(soil.ph, 5.5, 6.5),
        "Wheat" => within(soil.ph, 6.0, 7.5) && within(soil.moisture, 15.0, 45.0),
        "Corn" => within(soil.ph, 5.8, 7.0) && soil.nitrogen > 20.0,
        "Potatoes" => within(soil.ph, 4.8, 6.5) && soil.potassium > 20.0,
        _ => false,
    };
    crop_rule || within(soil.ph, 5.5, 7.0)
}

fn sowing_time(crop: &str) -> &'static str {
    match crop {
        "Rice" => "Early spring or late summer depending on your region",
        "Wheat" => "Fall for winter wheat, early spring for spring wheat",
        "Corn" => "2-3 weeks after the last spring frost when soil is warm",
        "Potatoes" => "Early spring, 2 weeks before the last frost date",
        "Tomatoes" => "After all danger of frost has passed",
        "Lettuce" => "Early spring or fall in cooler temperatures",
        "Carrots" => "3 weeks before the last frost date",
        "Soybeans" => "Late spring when soil temperatures reach 55-60°F",
        "Cotton" => "When soil temperature is consistently above 65°F",
        "Sugarcane" => "Spring planting when temperatures are consistently warm",
        _ => "Spring or early summer depending on your climate",
    }
}

fn irrigation_tip(crop: &str, moisture: f64) -> &'static str {
    match crop {
        "Rice" => "Maintain flooded conditions during most growth stages",
        "Corn" | "Potatoes" => "Regular irrigation, especially during tasseling/tuber formation",
        _ if moisture < 30.0 => "Implement frequent irrigation scheduling with moisture sensors",
        _ => "Water regularly, ensuring soil stays moist but not waterlogged",
    }
}

fn pest_control_tip(crop: &str) -> &'static str {
    match crop {
        "Rice" => "Monitor for rice water weevil and rice stink bugs",
        "Wheat" => "Watch for aphids, Hessian fly, and wheat stem sawfly",
        "Corn" => "Scout for corn earworm, European corn borer, and rootworm",
        "Potatoes" => "Prevent Colorado potato beetle and potato blight",
        "Tomatoes" => "Watch for hornworms, whiteflies, and early blight",
        _ => "Implement IPM practices: regular scouting, beneficial insects, and targeted treatments only when necessary",
    }
}

fn fertilizer_tip(crop: &str, soil: &TreatmentPlanRequest) -> String {
    if soil.nitrogen < 20.0 {
        let amount = if crop == "Legumes" { "minimal amounts" } else { "higher amounts" };
        return format!("Apply nitrogen-rich fertilizer ({})", amount);
    }
    if soil.phosphorus < 20.0 {
        return "Add phosphorus to promote root development and flowering".to_string();
    }
    if soil.potassium < 20.0 {
        return "Supplement with potassium for improved crop quality and disease resistance".to_string();
    }
    "Apply balanced fertilizer according to crop growth stage, focusing on organic options when possible".to_string()
}

/// Corrective steps, most urgent first.
pub fn treatment_suggestions(soil: &TreatmentPlanRequest) -> Vec<String> {
    let rules: [(bool, &str); 8] = [
        (soil.ph < 5.5, "Increase soil pH by adding agricultural lime"),
        (soil.ph > 7.5, "Lower soil pH by adding sulfur or sulfur-containing amendments"),
        (soil.organic_matter < 3.0, "Add compost or well-rotted manure to improve organic matter content"),
        (soil.moisture < 20.0, "Improve soil structure with organic matter to increase water retention"),
        (soil.moisture > 80.0, "Improve drainage through raised beds or drainage systems"),
        (soil.nitrogen < 20.0, "Apply nitrogen fertilizer or plant leguminous cover crops"),
        (soil.phosphorus < 15.0, "Add phosphate fertilizers or bone meal"),
        (soil.potassium < 15.0, "Add potassium-rich amendments like wood ash or greensand"),
    ];

    let suggestions: Vec<String> = rules
        .iter()
        .filter(|(applies, _)| *applies)
        .map(|(_, text)| text.to_string())
        .collect();

    if suggestions.is_empty() {
        vec!["Conduct a comprehensive soil test for detailed treatment recommendations".to_string()]
    } else {
        suggestions
    }
}

pub fn treatment_plan(soil: &TreatmentPlanRequest) -> TreatmentPlan {
    let crop = soil.crop.trim().to_string();
    if is_suitable(&crop, soil) {
        TreatmentPlan {
            message: format!("Good news! Your soil is suitable for growing {}.", crop),
            tips: Some(GrowingTips {
                sowing_time: sowing_time(&crop).to_string(),
                irrigation: irrigation_tip(&crop, soil.moisture).to_string(),
                pest_control: pest_control_tip(&crop).to_string(),
                fertilizer: fertilizer_tip(&crop, soil),
            }),
            treatment_suggestions: Vec::new(),
            suitable: true,
            crop,
        }
    } else {
        TreatmentPlan {
            message: format!("Warning: Your soil needs treatment before planting {}.", crop),
            tips: None,
            treatment_suggestions: treatment_suggestions(soil),
            suitable: false,
            crop,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn soil(crop: &str) -> TreatmentPlanRequest {
        TreatmentPlanRequest {
            crop: crop.to_string(),
            nitrogen: 40.0,
            phosphorus: 30.0,
            potassium: 30.0,
            ph: 6.5,
            moisture: 35.0,
            organic_matter: 4.0,
        }
    }

    #[test]
    fn test_ph_boundaries_are_strict() {
        assert_eq!(classify_ph(5.99), PhClass::Acidic);
        assert_eq!(classify_ph(6.0), PhClass::Optimal);
        assert_eq!(classify_ph(7.5), PhClass::Optimal);
        assert_eq!(classify_ph(7.51), PhClass::Alkaline);
    }

    #[test]
    fn test_nutrient_boundaries() {
        assert_eq!(classify_nitrogen(39.9), NutrientLevel::Low);
        assert_eq!(classify_nitrogen(40.0), NutrientLevel::Medium);
        assert_eq!(classify_nitrogen(80.0), NutrientLevel::High);

        assert_eq!(classify_phosphorus(19.0), NutrientLevel::Low);
        assert_eq!(classify_phosphorus(20.0), NutrientLevel::Medium);
        assert_eq!(classify_phosphorus(40.0), NutrientLevel::High);

        assert_eq!(classify_potassium(149.0), NutrientLevel::Low);
        assert_eq!(classify_potassium(150.0), NutrientLevel::Medium);
        assert_eq!(classify_potassium(250.0), NutrientLevel::High);
    }

    #[test]
    fn test_tones() {
        assert_eq!(PhClass::Acidic.tone(), Tone::Warning);
        assert_eq!(PhClass::Alkaline.tone(), Tone::Caution);
        assert_eq!(NutrientLevel::High.tone(), Tone::Good);
    }

    #[test]
    fn test_interpret_skips_missing_readings() {
        let now = Utc::now();
        let test = SoilTest {
            id: "t1".into(),
            user_id: "u1".into(),
            location: "Field".into(),
            field_size: None,
            test_type: "Basic Soil Analysis".into(),
            test_date: now,
            status: SoilTestStatus::Completed,
            ph_level: Some(5.2),
            nitrogen_level: None,
            phosphorus_level: Some(45.0),
            potassium_level: None,
            organic_matter: None,
            moisture_content: None,
            sample_collection_date: None,
            analysis_started_date: None,
            completed_date: None,
            created_at: now,
            updated_at: now,
        };

        let result = interpret(&test);
        assert_eq!(result.readings.len(), 2);
        assert_eq!(result.readings[0].label, "Acidic");
        assert_eq!(result.readings[1].nutrient, "phosphorus");
        assert_eq!(result.readings[1].label, "High");
        assert_eq!(result.status.label, "Completed");
    }

    #[test]
    fn test_crop_rules_widen_general_ph_window() {
        // Dry rice soil at pH 6.8 still passes the general window.
        let mut rice = soil("Rice");
        rice.ph = 6.8;
        assert!(is_suitable("Rice", &rice));
        rice.ph = 7.2;
        assert!(!is_suitable("Rice", &rice));

        let mut potatoes = soil("Potatoes");
        potatoes.ph = 5.0;
        assert!(is_suitable("Potatoes", &potatoes));
        potatoes.potassium = 10.0;
        assert!(!is_suitable("Potatoes", &potatoes));

        let mut wheat = soil("Wheat");
        wheat.ph = 7.3;
        assert!(is_suitable("Wheat", &wheat));
        wheat.moisture = 50.0;
        assert!(!is_suitable("Wheat", &wheat));

        assert!(is_suitable("Barley", &soil("Barley")));
    }

    #[test]
    fn test_crop_name_is_trimmed_before_rules_and_tips() {
        // pH 5.0 only passes the potato rule.
        let mut potatoes = soil("  Potatoes ");
        potatoes.ph = 5.0;
        let plan = treatment_plan(&potatoes);
        assert_eq!(plan.crop, "Potatoes");
        assert!(plan.suitable);

        let mut rice = soil(" Rice");
        rice.moisture = 70.0;
        let plan = treatment_plan(&rice);
        assert_eq!(plan.tips.unwrap().irrigation, "Maintain flooded conditions during most growth stages");

        let mut legumes = soil(" Legumes");
        legumes.nitrogen = 10.0;
        let plan = treatment_plan(&legumes);
        assert_eq!(plan.tips.unwrap().fertilizer, "Apply nitrogen-rich fertilizer (minimal amounts)");
    }

    #[test]
    fn test_suitable_plan_has_tips() {
        let plan = treatment_plan(&soil("Wheat"));
        assert!(plan.suitable);
        assert_eq!(plan.message, "Good news! Your soil is suitable for growing Wheat.");
        let tips = plan.tips.unwrap();
        assert_eq!(tips.sowing_time, "Fall for winter wheat, early spring for spring wheat");
        assert_eq!(tips.irrigation, "Water regularly, ensuring soil stays moist but not waterlogged");
        assert!(plan.treatment_suggestions.is_empty());
    }

    #[test]
    fn test_unsuitable_plan_orders_suggestions() {
        let mut acidic = soil("Corn");
        acidic.ph = 4.9;
        acidic.organic_matter = 1.0;
        acidic.potassium = 10.0;

        let plan = treatment_plan(&acidic);
        assert!(!plan.suitable);
        assert_eq!(
            plan.treatment_suggestions,
            vec![
                "Increase soil pH by adding agricultural lime",
                "Add compost or well-rotted manure to improve organic matter content",
                "Add potassium-rich amendments like wood ash or greensand",
            ]
        );
    }

    #[test]
    fn test_unsuitable_without_specific_problem() {
        let mut wheat = soil("Wheat");
        wheat.ph = 7.2;
        wheat.moisture = 50.0;
        assert_eq!(
            treatment_plan(&wheat).treatment_suggestions,
            vec!["Conduct a comprehensive soil test for detailed treatment recommendations"]
        );
    }
}
