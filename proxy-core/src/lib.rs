pub mod compartment;
pub mod decision;
pub mod error;
pub mod fhir_path;
pub mod inspector;
pub mod operation_outcome;
pub mod request_view;
pub mod scope;
pub mod search_query;

pub use compartment::CompartmentMap;
pub use decision::{AccessDecision, DecodedToken, Mutation, PostProcessor};
pub use error::{ProxyError, Result};
pub use fhir_path::{FoundReference, PatientFhirPathMap};
pub use inspector::{BundlePatients, PatientId, ResourceInspector};
pub use operation_outcome::{
    CodeableConcept, Coding, IssueSeverity, IssueType, OperationOutcome, OperationOutcomeIssue,
};
pub use request_view::{RequestMethod, RequestView};
pub use scope::{Permission, Principal, SmartScope};
pub use search_query::SearchQuery;
