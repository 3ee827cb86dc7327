use crate::{
    error::RowError,
    proknow::{EntitySummary, Patient, ProKnowStore},
};

/// Finds the one patient with MRN `patient_id` and fetches it.
pub async fn match_patient<S: ProKnowStore>(
    store: &S,
    workspace: &str,
    patient_id: &str,
) -> Result<Patient, RowError> {
    let mut found = store
        .lookup_patients(workspace, &[patient_id.to_string()])
        .await
        .map_err(|err| RowError::store(patient_id, err))?;

    if found.len() > 1 {
        return Err(RowError::PatientIdNotUnique {
            patient_id: patient_id.to_string(),
        });
    }
    let summary = found.pop().ok_or_else(|| RowError::PatientNotFound {
        patient_id: patient_id.to_string(),
    })?;

    store
        .get_patient(workspace, &summary.id)
        .await
        .map_err(|err| RowError::store(patient_id, err))
}

/// The single entity of type `context` whose description is exactly `description`.
pub fn match_entity<'a>(
    patient: &'a Patient,
    context: &str,
    description: &str,
) -> Result<&'a EntitySummary, RowError> {
    let mut found = patient.find_entities(context, Some(description));
    match found.len() {
        1 => Ok(found.remove(0)),
        0 => Err(RowError::EntityNotFound {
            patient_id: patient.mrn.clone(),
            context: context.to_string(),
            description: description.to_string(),
        }),
        _ => Err(RowError::EntityNotUnique {
            patient_id: patient.mrn.clone(),
            context: context.to_string(),
            description: description.to_string(),
        }),
    }
}
