use bytes::Bytes;
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use subtle::ConstantTimeEq;
use uuid::Uuid;

use trove_core::{
    attachment_digest, Access, AccessId, ApiError, Attachment, Event, EventId, PermissionView,
    Username,
};
use trove_store::FileRead;

use crate::auth::hmac_hex;
use crate::error::StoreResultExt;
use crate::services::Services;

/// Build the signed read token for one attachment under one access:
/// `accessId + "-" + hmac(secret, fileId + accessToken)`.
#[must_use]
pub fn build_read_token(access: &Access, file_id: &str, secret: &str) -> String {
    let message = format!("{file_id}{}", access.token.as_str());
    format!("{}-{}", access.id, hmac_hex(secret, &message))
}

/// Verify a read token for `file_id`, loading and returning the access it
/// references. The hmac part carries no `-`, so the split happens at the
/// last separator.
pub async fn verify_read_token(
    services: &Services,
    username: &Username,
    file_id: &str,
    read_token: &str,
) -> Result<Access, ApiError> {
    let Some((access_id, signature)) = read_token.rsplit_once('-') else {
        return Err(ApiError::invalid_credentials("Malformed file read token"));
    };
    let access = services
        .storage
        .access_get(username, &AccessId::new(access_id))
        .await
        .api_err()?
        .ok_or_else(|| ApiError::invalid_credentials("Invalid file read token"))?;
    if access.is_deleted() || access.is_expired(trove_core::unix_now()) {
        return Err(ApiError::invalid_credentials("Invalid file read token"));
    }

    let message = format!("{file_id}{}", access.token.as_str());
    let expected = hmac_hex(&services.settings.files_read_token_secret, &message);
    if bool::from(expected.as_bytes().ct_eq(signature.as_bytes())) {
        Ok(access)
    } else {
        Err(ApiError::invalid_credentials("Invalid file read token"))
    }
}

/// The gate's successful read: attachment metadata plus the open body.
#[derive(Debug)]
pub struct AttachmentRead {
    pub attachment: Attachment,
    pub file: FileRead,
}

/// Resolve and authorize an attachment read.
///
/// The event must exist, the access must be able to read events on at least
/// one of its streams, and the file id must be indexed on the event.
pub async fn open_attachment(
    services: &Services,
    username: &Username,
    perms: &PermissionView<'_>,
    event_id: &EventId,
    file_id: &str,
) -> Result<AttachmentRead, ApiError> {
    let event = services
        .storage
        .event_get(username, event_id)
        .await
        .api_err()?
        .ok_or_else(|| ApiError::unknown_resource("event", event_id.as_str()))?;

    if !perms.can_read_event(&event.stream_ids) {
        return Err(ApiError::forbidden(
            "Access lacks read permission on this event's streams",
        ));
    }

    let attachment = event
        .attachments
        .iter()
        .find(|a| a.id == file_id)
        .cloned()
        .ok_or_else(|| ApiError::unknown_resource("attachment", file_id))?;

    let file = services
        .files
        .open(username, event_id, file_id)
        .await
        .api_err()?
        .ok_or_else(|| ApiError::unknown_resource("attachment", file_id))?;

    Ok(AttachmentRead { attachment, file })
}

/// Stage an uploaded file and index it on the event: the body moves into
/// the per-user attachments directory and the metadata (with freshly
/// computed size and, when enabled, integrity digest) is appended to
/// `event.attachments`.
pub async fn index_attachment(
    services: &Services,
    username: &Username,
    event: &mut Event,
    file_name: &str,
    content_type: &str,
    data: Bytes,
) -> Result<(), ApiError> {
    let integrity = services
        .settings
        .integrity_events
        .then(|| attachment_digest(&data));
    let file_id = Uuid::new_v4().to_string();
    let temp_id = services.files.stage(data).await.api_err()?;
    let size = services
        .files
        .adopt(username, &event.id, &file_id, &temp_id)
        .await
        .api_err()?;
    event.attachments.push(Attachment {
        id: file_id,
        file_name: file_name.to_owned(),
        content_type: content_type.to_owned(),
        size,
        integrity,
    });
    Ok(())
}

/// RFC 5987 `Content-Disposition` value for an attachment download: an
/// ASCII fallback plus the UTF-8 `filename*` form.
#[must_use]
pub fn content_disposition(file_name: &str) -> String {
    let ascii: String = file_name
        .chars()
        .map(|c| if c.is_ascii() && c != '"' { c } else { '_' })
        .collect();
    let encoded = utf8_percent_encode(file_name, NON_ALPHANUMERIC).to_string();
    format!("attachment; filename=\"{ascii}\"; filename*=UTF-8''{encoded}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use trove_core::{AccessType, StreamId, Token, Tracking};
    use trove_store::Storage;

    fn event_with_attachment() -> Event {
        Event {
            id: EventId::new("e1"),
            stream_ids: vec![StreamId::from("diary")],
            event_type: "picture/attached".to_owned(),
            time: 10.0,
            duration: None,
            content: None,
            attachments: Vec::new(),
            tags: Vec::new(),
            client_data: None,
            trashed: false,
            integrity: None,
            deleted: None,
            head_id: None,
            tracking: Tracking::init(10.0, &AccessId::new("a")),
        }
    }

    fn shared_access(id: &str, token: &str) -> Access {
        Access {
            id: AccessId::new(id),
            token: Token::new(token),
            access_type: AccessType::Shared,
            name: id.to_owned(),
            device_name: None,
            permissions: Vec::new(),
            expires: None,
            deleted: None,
            client_data: None,
            tracking: Tracking::init(1.0, &AccessId::new("creator")),
        }
    }

    #[test]
    fn content_disposition_is_rfc5987() {
        let value = content_disposition("résumé 2024.pdf");
        assert!(value.starts_with("attachment; filename=\"r_sum_ 2024.pdf\""));
        assert!(value.contains("filename*=UTF-8''r%C3%A9sum%C3%A9%202024%2Epdf"));
    }

    #[tokio::test]
    async fn read_token_roundtrip() {
        let (services, fixture) = crate::testing::services_with_user().await;
        let access = shared_access("file-reader", "reader-token");
        services
            .storage
            .access_insert(&fixture.username, &access)
            .await
            .unwrap();

        let token = build_read_token(&access, "f1", &services.settings.files_read_token_secret);
        let resolved = verify_read_token(&services, &fixture.username, "f1", &token)
            .await
            .unwrap();
        assert_eq!(resolved.id, access.id);

        // Wrong file id fails the signature.
        assert!(verify_read_token(&services, &fixture.username, "f2", &token)
            .await
            .is_err());
        // Tampered signature fails.
        let bad = format!("{}-deadbeef", access.id);
        assert!(verify_read_token(&services, &fixture.username, "f1", &bad)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn gate_checks_event_permission_and_metadata() {
        let (services, fixture) = crate::testing::services_with_user().await;
        let alice = fixture.username.clone();

        let mut event = event_with_attachment();
        index_attachment(
            &services,
            &alice,
            &mut event,
            "note.txt",
            "text/plain",
            Bytes::from_static(b"hello"),
        )
        .await
        .unwrap();
        assert_eq!(event.attachments.len(), 1);
        assert_eq!(event.attachments[0].size, 5);
        services.storage.event_insert(&alice, &event).await.unwrap();

        let user_access = services
            .storage
            .access_get(&alice, &fixture.personal_access_id)
            .await
            .unwrap()
            .unwrap();
        let tree = trove_core::StreamTree::build(vec![]).unwrap();
        let perms = PermissionView::new(&user_access, &tree);

        let read = open_attachment(
            &services,
            &alice,
            &perms,
            &event.id,
            &event.attachments[0].id,
        )
        .await
        .unwrap();
        assert_eq!(read.attachment.file_name, "note.txt");
        assert_eq!(read.file.size, 5);

        // Unknown attachment id.
        let err = open_attachment(&services, &alice, &perms, &event.id, "ghost")
            .await
            .unwrap_err();
        assert_eq!(err.http_status(), 404);

        // Unknown event id.
        let err = open_attachment(&services, &alice, &perms, &EventId::new("ghost"), "f")
            .await
            .unwrap_err();
        assert_eq!(err.http_status(), 404);
    }
}
