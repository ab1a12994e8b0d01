//! Value correction applied to every card write.
//!
//! A raw value passes through an ordered list of steps before it is stored.
//! Each step is a plain function of the property and the value so far.

use crate::domain::{Project, PropertyDefinition, PropertyKind};
use crate::errors::DomainError;

use super::{canonical_number, same_enumeration_value};

/// One correction: `(project, property, value) -> value`.
pub type CorrectionStep =
    fn(&Project, &PropertyDefinition, Option<String>) -> Result<Option<String>, DomainError>;

pub struct ValuePipeline<'p> {
    project: &'p Project,
    steps: Vec<(&'static str, CorrectionStep)>,
}

impl<'p> ValuePipeline<'p> {
    /// The steps every card write goes through.
    pub fn new(project: &'p Project) -> Self {
        ValuePipeline {
            project,
            steps: vec![
                ("trim", trim),
                ("blank_is_null", blank_is_null),
                ("reject_calculated", reject_calculated),
                ("enumeration", canonical_enumeration_value),
                ("number", canonical_free_number),
                ("date", iso_date),
            ],
        }
    }

    pub fn with_step(mut self, name: &'static str, step: CorrectionStep) -> Self {
        self.steps.push((name, step));
        self
    }

    pub fn step_names(&self) -> Vec<&'static str> {
        self.steps.iter().map(|(name, _)| *name).collect()
    }

    pub fn correct(
        &self,
        property: &PropertyDefinition,
        value: Option<&str>,
    ) -> Result<Option<String>, DomainError> {
        let mut value = value.map(str::to_string);
        for (_, step) in &self.steps {
            value = step(self.project, property, value)?;
        }
        Ok(value)
    }
}

fn trim(
    _: &Project,
    _: &PropertyDefinition,
    value: Option<String>,
) -> Result<Option<String>, DomainError> {
    Ok(value.map(|v| v.trim().to_string()))
}

fn blank_is_null(
    _: &Project,
    _: &PropertyDefinition,
    value: Option<String>,
) -> Result<Option<String>, DomainError> {
    Ok(value.filter(|v| !v.is_empty()))
}

fn reject_calculated(
    _: &Project,
    property: &PropertyDefinition,
    value: Option<String>,
) -> Result<Option<String>, DomainError> {
    if property.is_calculated() {
        return Err(DomainError::invalid(format!(
            "{} is a calculated property and cannot be edited.",
            property.name
        )));
    }
    Ok(value)
}

fn canonical_enumeration_value(
    _: &Project,
    property: &PropertyDefinition,
    value: Option<String>,
) -> Result<Option<String>, DomainError> {
    let (PropertyKind::Enumerated { numeric, values }, Some(raw)) = (&property.kind, &value)
    else {
        return Ok(value);
    };
    if let Some(existing) = values
        .iter()
        .find(|v| same_enumeration_value(*numeric, &v.value, raw))
    {
        return Ok(Some(existing.value.clone()));
    }
    if *numeric {
        return match canonical_number(raw) {
            Some(number) => Ok(Some(number)),
            None => Err(DomainError::invalid(format!(
                "{} is an invalid numeric value for {}.",
                raw, property.name
            ))),
        };
    }
    Err(DomainError::invalid(format!(
        "{} is not a valid value for {}.",
        raw, property.name
    )))
}

fn canonical_free_number(
    _: &Project,
    property: &PropertyDefinition,
    value: Option<String>,
) -> Result<Option<String>, DomainError> {
    match (&property.kind, value) {
        (PropertyKind::Text { numeric: true }, Some(raw)) => match canonical_number(&raw) {
            Some(number) => Ok(Some(number)),
            None => Err(DomainError::invalid(format!(
                "{} is an invalid numeric value for {}.",
                raw, property.name
            ))),
        },
        (_, value) => Ok(value),
    }
}

fn iso_date(
    project: &Project,
    property: &PropertyDefinition,
    value: Option<String>,
) -> Result<Option<String>, DomainError> {
    match (&property.kind, value) {
        (PropertyKind::Date, Some(raw)) => match project.parse_date(&raw) {
            Some(date) => Ok(Some(date.format("%Y-%m-%d").to_string())),
            None => Err(DomainError::invalid(format!(
                "{} is an invalid date. Enter dates in {} format or YYYY-MM-DD.",
                raw, project.date_format
            ))),
        },
        (_, value) => Ok(value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::PropertyId;
    use crate::properties::enumeration_values;

    fn project() -> (Project, PropertyId, PropertyId, PropertyId, PropertyId) {
        let mut project = Project::new("agile", "Agile");
        project.create_card_type("Story").unwrap();
        let points = project
            .create_property(
                "Points",
                PropertyKind::Enumerated {
                    numeric: true,
                    values: enumeration_values(&["1", "2", "3"]),
                },
                &["Story"],
            )
            .unwrap();
        let status = project
            .create_property(
                "Status",
                PropertyKind::Enumerated {
                    numeric: false,
                    values: enumeration_values(&["Open", "Done"]),
                },
                &["Story"],
            )
            .unwrap();
        let due = project
            .create_property("Due", PropertyKind::Date, &["Story"])
            .unwrap();
        let estimate = project
            .create_property("Estimate", PropertyKind::Text { numeric: true }, &["Story"])
            .unwrap();
        (project, points, status, due, estimate)
    }

    #[test]
    fn test_enumeration_values_are_canonicalized() {
        let (project, points, status, _, _) = project();
        let pipeline = ValuePipeline::new(&project);
        let points = project.property(points).unwrap();
        let status = project.property(status).unwrap();

        assert_eq!(
            pipeline.correct(points, Some(" 2.0 ")).unwrap(),
            Some("2".to_string())
        );
        assert_eq!(
            pipeline.correct(points, Some("13")).unwrap(),
            Some("13".to_string())
        );
        assert_eq!(
            pipeline.correct(status, Some("done")).unwrap(),
            Some("Done".to_string())
        );
        assert!(pipeline.correct(status, Some("Blocked")).is_err());
        assert!(pipeline.correct(points, Some("lots")).is_err());
    }

    #[test]
    fn test_blank_values_become_null() {
        let (project, _, status, _, _) = project();
        let pipeline = ValuePipeline::new(&project);
        let status = project.property(status).unwrap();
        assert_eq!(pipeline.correct(status, Some("   ")).unwrap(), None);
        assert_eq!(pipeline.correct(status, None).unwrap(), None);
    }

    #[test]
    fn test_dates_and_free_numbers() {
        let (project, _, _, due, estimate) = project();
        let pipeline = ValuePipeline::new(&project);
        let due = project.property(due).unwrap();
        let estimate = project.property(estimate).unwrap();

        assert_eq!(
            pipeline.correct(due, Some("03 Feb 2024")).unwrap(),
            Some("2024-02-03".to_string())
        );
        assert!(pipeline.correct(due, Some("someday")).is_err());
        assert_eq!(
            pipeline.correct(estimate, Some("4.50")).unwrap(),
            Some("4.5".to_string())
        );
    }

    #[test]
    fn test_calculated_properties_are_rejected() {
        let (mut project, _, _, _, _) = project();
        let double = project
            .create_formula("Double", "Points * 2", false, &["Story"])
            .unwrap();
        let pipeline = ValuePipeline::new(&project);
        let err = pipeline
            .correct(project.property(double).unwrap(), Some("4"))
            .unwrap_err();
        assert!(err.to_string().contains("calculated property"));
    }

    #[test]
    fn test_custom_steps_run_last() {
        fn shout(
            _: &Project,
            _: &PropertyDefinition,
            value: Option<String>,
        ) -> Result<Option<String>, DomainError> {
            Ok(value.map(|v| v.to_uppercase()))
        }
        let (project, _, status, _, _) = project();
        let pipeline = ValuePipeline::new(&project).with_step("shout", shout);
        assert_eq!(pipeline.step_names().last(), Some(&"shout"));
        assert_eq!(
            pipeline
                .correct(project.property(status).unwrap(), Some("open"))
                .unwrap(),
            Some("OPEN".to_string())
        );
    }
}
