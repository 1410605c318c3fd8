use crate::clients::{Contact, ContactType, Entity, EntityType};
use crate::context::Doubles;
use crate::rawmsg::TwilioParams;

pub const ORG_ID: &str = "org-1";
pub const PRACTICE_PHONE: &str = "+14150000000";
pub const PATIENT_PHONE: &str = "+14151111111";
pub const PROVIDER_PHONE: &str = "+14152222222";
pub const CALL_SID: &str = "CA100";

pub fn phone_contact(value: &str, provisioned: bool) -> Contact {
    Contact {
        contact_type: ContactType::Phone,
        value: value.to_string(),
        provisioned,
    }
}

pub fn entity(id: &str, entity_type: EntityType, name: Option<&str>, contacts: Vec<Contact>) -> Entity {
    Entity {
        id: id.to_string(),
        entity_type,
        display_name: name.map(str::to_string),
        contacts,
        memberships: Vec::new(),
        account_ids: Vec::new(),
    }
}

/// Organization owning the practice number
pub fn seed_practice(doubles: &Doubles, name: Option<&str>) {
    doubles.directory.insert(entity(
        ORG_ID,
        EntityType::Organization,
        name,
        vec![phone_contact(PRACTICE_PHONE, true)],
    ));
}

/// Patient of the practice reachable on `PATIENT_PHONE`
pub fn seed_patient(doubles: &Doubles, name: Option<&str>) {
    let mut patient = entity("patient-1", EntityType::External, name, vec![phone_contact(PATIENT_PHONE, false)]);
    patient.memberships.push(ORG_ID.to_string());
    doubles.directory.insert(patient);
}

/// Parameters of the patient's call to the practice
pub fn inbound_params() -> TwilioParams {
    TwilioParams {
        from: PATIENT_PHONE.to_string(),
        to: PRACTICE_PHONE.to_string(),
        call_sid: CALL_SID.to_string(),
        ..Default::default()
    }
}

/// Strip the declaration so assertions read as the document body
pub fn body(xml: &str) -> &str {
    xml.split_once('\n').map(|(_, rest)| rest).unwrap_or(xml)
}
