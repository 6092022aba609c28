use uuid::Uuid;

/// Generate a request id: 128 random bits as 32 lowercase hex characters.
///
/// Unique within a process lifetime for every outstanding request, which is
/// all the pending-request table requires.
pub fn generate_request_id() -> String {
    Uuid::new_v4().simple().to_string()
}
