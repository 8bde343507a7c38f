//! Host-visible player events.
//!
//! Events are delivered per player on its event channel. On the wire each one
//! is a map: `{"event": <name>, "value": <value>}`, or `{"code", "message",
//! "details"}` for errors.

use serde_json::{ json, Value };


pub const ON_PREPARED: &str = "audio.onPrepared";
pub const ON_DURATION: &str = "audio.onDuration";
pub const ON_SEEK_COMPLETE: &str = "audio.onSeekComplete";
pub const ON_COMPLETE: &str = "audio.onComplete";
pub const ON_LOG: &str = "audio.onLog";


#[derive( Debug, Clone, PartialEq )]
pub enum PlayerEvent {
    Prepared( bool ),
    /// Duration in milliseconds, 0 when unknown.
    Duration( i64 ),
    SeekComplete,
    Complete,
    Log( String ),
    Error {
        code: String,
        message: String,
        details: Option<String>,
    },
}


impl PlayerEvent {
    /// Event name, or `None` for errors which carry no name.
    pub fn name( &self ) -> Option<&'static str> {
        match self {
            PlayerEvent::Prepared( _ ) => Some( ON_PREPARED ),
            PlayerEvent::Duration( _ ) => Some( ON_DURATION ),
            PlayerEvent::SeekComplete => Some( ON_SEEK_COMPLETE ),
            PlayerEvent::Complete => Some( ON_COMPLETE ),
            PlayerEvent::Log( _ ) => Some( ON_LOG ),
            PlayerEvent::Error { .. } => None,
        }
    }


    /// Encodes the event as the map sent to the host.
    pub fn to_message( &self ) -> Value {
        match self {
            PlayerEvent::Prepared( prepared ) => json!({ "event": ON_PREPARED, "value": prepared }),
            PlayerEvent::Duration( ms ) => json!({ "event": ON_DURATION, "value": ms }),
            PlayerEvent::SeekComplete => json!({ "event": ON_SEEK_COMPLETE, "value": true }),
            PlayerEvent::Complete => json!({ "event": ON_COMPLETE, "value": true }),
            PlayerEvent::Log( message ) => json!({ "event": ON_LOG, "value": message }),
            PlayerEvent::Error { code, message, details } => {
                let mut map = json!({ "code": code, "message": message });
                if let Some( details ) = details {
                    map[ "details" ] = Value::from( details.as_str() );
                }
                map
            }
        }
    }


    pub fn is_error( &self ) -> bool {
        matches!( self, PlayerEvent::Error { .. } )
    }
}


/// Delivers events to the host.
///
/// Called from player threads as well as the command thread; implementations
/// must not block for long.
pub trait EventSink: Send + Sync {
    fn emit( &self, channel: &str, event: &PlayerEvent );
}


#[cfg( test )]
mod tests {
    use super::*;


    #[test]
    fn test_event_map_encoding() {
        assert_eq!(
            PlayerEvent::Prepared( true ).to_message(),
            json!({ "event": "audio.onPrepared", "value": true })
        );
        assert_eq!(
            PlayerEvent::Duration( 1234 ).to_message(),
            json!({ "event": "audio.onDuration", "value": 1234 })
        );
        assert_eq!(
            PlayerEvent::SeekComplete.to_message(),
            json!({ "event": "audio.onSeekComplete", "value": true })
        );
    }


    #[test]
    fn test_error_encoding() {
        let event = PlayerEvent::Error {
            code: "LinuxAudioError".into(),
            message: "boom".into(),
            details: Some( "boom (Domain: core-error, Code: 1)".into() ),
        };
        let message = event.to_message();
        assert_eq!( message[ "code" ], "LinuxAudioError" );
        assert_eq!( message[ "details" ], "boom (Domain: core-error, Code: 1)" );
        assert!( message.get( "event" ).is_none() );
        assert_eq!( event.name(), None );
    }


    #[test]
    fn test_error_without_details() {
        let event = PlayerEvent::Error { code: "c".into(), message: "m".into(), details: None };
        assert!( event.to_message().get( "details" ).is_none() );
    }
}
