//! Method call parsing and dispatch.
//!
//! The host sends named method calls with a JSON argument map on one of the
//! plugin channels. Calls are parsed into a [`Command`] and executed against the
//! player registry; every call yields either a JSON result or a
//! [`CommandError`].

use std::sync::Arc;

use serde::{ Deserialize, Serialize };
use serde_json::{ Map, Value };
use thiserror::Error;

use crate::event::{ EventSink, PlayerEvent };
use crate::pipeline::PipelineFactory;
use crate::player::{ PlayerError, ERROR_CODE, EVENT_CHANNEL_PREFIX };
use crate::registry::{ PlayerRegistry, RegistryError };


/// Channel carrying per-player method calls.
pub const PLAYER_CHANNEL: &str = "xyz.luan/audioplayers";

/// Channel carrying process-wide method calls.
pub const GLOBAL_CHANNEL: &str = "xyz.luan/audioplayers.global";

/// Event channel for process-wide events.
pub const GLOBAL_EVENT_CHANNEL: &str = "xyz.luan/audioplayers.global/events";

pub const CODE_UNIMPLEMENTED: &str = "unimplemented";
pub const CODE_INVALID_ARGUMENTS: &str = "invalid_arguments";


/// Error result of a method call.
#[derive( Debug, Clone, PartialEq, Error, Serialize, Deserialize )]
#[error( "{code}: {message}" )]
pub struct CommandError {
    pub code: String,
    pub message: String,
    #[serde( default, skip_serializing_if = "Option::is_none" )]
    pub details: Option<String>,
}


impl CommandError {
    pub fn new( code: &str, message: impl Into<String> ) -> Self {
        Self { code: code.to_string(), message: message.into(), details: None }
    }


    pub fn unimplemented() -> Self {
        Self::new( CODE_UNIMPLEMENTED, "method not implemented" )
    }


    pub fn invalid_arguments( message: impl Into<String> ) -> Self {
        Self::new( CODE_INVALID_ARGUMENTS, message )
    }
}


impl From<PlayerError> for CommandError {
    fn from( e: PlayerError ) -> Self {
        Self::new( ERROR_CODE, e.to_string() )
    }
}


impl From<RegistryError> for CommandError {
    fn from( e: RegistryError ) -> Self {
        match e {
            RegistryError::Create( inner ) => Self {
                code: ERROR_CODE.to_string(),
                message: "Failed to create player".into(),
                details: Some( inner.to_string() ),
            },
            other => Self::new( ERROR_CODE, other.to_string() ),
        }
    }
}


/// A method call as received from the host.
#[derive( Debug, Clone, PartialEq, Serialize, Deserialize )]
pub struct MethodCall {
    pub channel: String,
    pub method: String,
    #[serde( default )]
    pub args: Map<String, Value>,
}


impl MethodCall {
    pub fn new( channel: &str, method: &str, args: Value ) -> Self {
        let args = match args {
            Value::Object( map ) => map,
            _ => Map::new(),
        };
        Self { channel: channel.to_string(), method: method.to_string(), args }
    }


    fn str_arg( &self, key: &str ) -> Result<String, CommandError> {
        self.args
            .get( key )
            .and_then( Value::as_str )
            .map( str::to_string )
            .ok_or_else( || CommandError::invalid_arguments( format!( "Missing string argument: {}", key ) ) )
    }


    fn f64_arg( &self, key: &str ) -> Result<f64, CommandError> {
        self.args
            .get( key )
            .and_then( Value::as_f64 )
            .ok_or_else( || CommandError::invalid_arguments( format!( "Missing number argument: {}", key ) ) )
    }


    fn i64_arg( &self, key: &str ) -> Result<i64, CommandError> {
        let value = self.args.get( key );
        value
            .and_then( Value::as_i64 )
            .or_else( || value.and_then( Value::as_f64 ).map( |v| v.round() as i64 ) )
            .ok_or_else( || CommandError::invalid_arguments( format!( "Missing integer argument: {}", key ) ) )
    }


    fn bool_arg_or( &self, key: &str, default: bool ) -> bool {
        self.args.get( key ).and_then( Value::as_bool ).unwrap_or( default )
    }
}


/// Operation on a single player.
#[derive( Debug, Clone, PartialEq )]
pub enum PlayerAction {
    Create,
    Dispose,
    Pause,
    Resume,
    Stop,
    Release,
    Seek { position_ms: i64 },
    SetSourceUrl { url: String, is_local: bool },
    SetSourceBytes,
    GetDuration,
    GetCurrentPosition,
    SetVolume { volume: f64 },
    SetPlaybackRate { rate: f64 },
    SetReleaseMode { mode: String },
    SetPlayerMode { mode: String },
    SetBalance { balance: f64 },
    EmitLog { message: String },
    EmitError { code: String, message: String },
}


/// Parsed method call.
#[derive( Debug, Clone, PartialEq )]
pub enum Command {
    Player { player_id: String, action: PlayerAction },

    // Global channel
    SetAudioContext,
    GlobalLog { message: String },
    GlobalError { code: String, message: String },

    /// Subscription to an event channel.
    Listen,
}


impl Command {
    /// Parses a method call.
    ///
    /// Unknown methods and channels give [`CODE_UNIMPLEMENTED`], missing or
    /// mistyped arguments [`CODE_INVALID_ARGUMENTS`].
    pub fn parse( call: &MethodCall ) -> Result<Self, CommandError> {
        let channel = call.channel.as_str();

        if call.method == "listen"
            && ( channel == GLOBAL_EVENT_CHANNEL || channel.starts_with( EVENT_CHANNEL_PREFIX ) )
        {
            return Ok( Command::Listen );
        }

        match channel {
            GLOBAL_CHANNEL => Self::parse_global( call ),
            PLAYER_CHANNEL => {
                let player_id = call.str_arg( "playerId" )?;
                let action = Self::parse_player( call )?;
                Ok( Command::Player { player_id, action } )
            }
            _ => Err( CommandError::unimplemented() ),
        }
    }


    fn parse_global( call: &MethodCall ) -> Result<Self, CommandError> {
        match call.method.as_str() {
            "setAudioContext" | "init" => Ok( Command::SetAudioContext ),
            "emitLog" => Ok( Command::GlobalLog { message: call.str_arg( "message" )? } ),
            "emitError" => Ok( Command::GlobalError {
                code: call.str_arg( "code" )?,
                message: call.str_arg( "message" )?,
            }),
            _ => Err( CommandError::unimplemented() ),
        }
    }


    fn parse_player( call: &MethodCall ) -> Result<PlayerAction, CommandError> {
        let action = match call.method.as_str() {
            "create" => PlayerAction::Create,
            "dispose" => PlayerAction::Dispose,
            "pause" => PlayerAction::Pause,
            "resume" => PlayerAction::Resume,
            "stop" => PlayerAction::Stop,
            "release" => PlayerAction::Release,
            "seek" => PlayerAction::Seek { position_ms: call.i64_arg( "position" )? },
            "setSourceUrl" => PlayerAction::SetSourceUrl {
                url: call.str_arg( "url" )?,
                is_local: call.bool_arg_or( "isLocal", false ),
            },
            "setSourceBytes" => PlayerAction::SetSourceBytes,
            "getDuration" => PlayerAction::GetDuration,
            "getCurrentPosition" => PlayerAction::GetCurrentPosition,
            "setVolume" => PlayerAction::SetVolume { volume: call.f64_arg( "volume" )? },
            "setPlaybackRate" => PlayerAction::SetPlaybackRate { rate: call.f64_arg( "playbackRate" )? },
            "setReleaseMode" => PlayerAction::SetReleaseMode { mode: call.str_arg( "releaseMode" )? },
            "setPlayerMode" => PlayerAction::SetPlayerMode { mode: call.str_arg( "playerMode" )? },
            "setBalance" => PlayerAction::SetBalance { balance: call.f64_arg( "balance" )? },
            "emitLog" => PlayerAction::EmitLog { message: call.str_arg( "message" )? },
            "emitError" => PlayerAction::EmitError {
                code: call.str_arg( "code" )?,
                message: call.str_arg( "message" )?,
            },
            _ => return Err( CommandError::unimplemented() ),
        };
        Ok( action )
    }
}


/// Applies the local-file scheme to a source path.
pub fn source_uri( url: &str, is_local: bool ) -> String {
    if is_local && !url.starts_with( "file://" ) {
        format!( "file://{}", url )
    } else {
        url.to_string()
    }
}


fn optional_ms( value: Option<i64> ) -> Value {
    value.map( Value::from ).unwrap_or( Value::Null )
}


/// Executes method calls against an owned player registry.
pub struct CommandRouter {
    registry: PlayerRegistry,
    sink: Arc<dyn EventSink>,
}


impl CommandRouter {
    pub fn new( factory: Arc<dyn PipelineFactory>, sink: Arc<dyn EventSink> ) -> Self {
        Self {
            registry: PlayerRegistry::new( factory, Arc::clone( &sink ) ),
            sink,
        }
    }


    pub fn registry( &self ) -> &PlayerRegistry {
        &self.registry
    }


    /// Parses and executes one call.
    pub fn handle( &self, call: &MethodCall ) -> Result<Value, CommandError> {
        let command = Command::parse( call ).inspect_err( |e| {
            tracing::debug!( "Rejected {} on {}: {}", call.method, call.channel, e );
        })?;
        self.execute( command )
    }


    pub fn execute( &self, command: Command ) -> Result<Value, CommandError> {
        match command {
            Command::Player { player_id, action } => self.execute_player( &player_id, action ),
            Command::SetAudioContext => {
                tracing::info!( "Setting AudioContext is not supported" );
                self.sink.emit(
                    GLOBAL_EVENT_CHANNEL,
                    &PlayerEvent::Log( "Setting AudioContext is not supported".into() ),
                );
                Ok( Value::Null )
            }
            Command::GlobalLog { message } => {
                self.sink.emit( GLOBAL_EVENT_CHANNEL, &PlayerEvent::Log( message ) );
                Ok( Value::Null )
            }
            Command::GlobalError { code, message } => {
                self.sink.emit( GLOBAL_EVENT_CHANNEL, &PlayerEvent::Error { code, message, details: None } );
                Ok( Value::Null )
            }
            Command::Listen => Ok( Value::Null ),
        }
    }


    fn execute_player( &self, player_id: &str, action: PlayerAction ) -> Result<Value, CommandError> {
        if action == PlayerAction::Create {
            self.registry.create( player_id )?;
            return Ok( Value::Null );
        }

        let player = self.registry.get( player_id )?;

        match action {
            PlayerAction::Create => {}
            PlayerAction::Dispose => {
                player.dispose()?;
                self.registry.remove( player_id );
            }
            PlayerAction::Pause => player.pause()?,
            PlayerAction::Resume => player.resume()?,
            PlayerAction::Stop => player.stop()?,
            PlayerAction::Release => player.release()?,
            PlayerAction::Seek { position_ms } => player.seek( position_ms )?,
            PlayerAction::SetSourceUrl { url, is_local } => {
                player.set_source_url( &source_uri( &url, is_local ), is_local )?;
            }
            PlayerAction::SetSourceBytes => return Err( CommandError::unimplemented() ),
            PlayerAction::GetDuration => return Ok( optional_ms( player.duration()? ) ),
            PlayerAction::GetCurrentPosition => return Ok( optional_ms( player.position()? ) ),
            PlayerAction::SetVolume { volume } => player.set_volume( volume )?,
            PlayerAction::SetPlaybackRate { rate } => player.set_playback_rate( rate )?,
            PlayerAction::SetReleaseMode { mode } => player.set_release_mode( &mode )?,
            PlayerAction::SetPlayerMode { mode } => player.set_player_mode( &mode )?,
            PlayerAction::SetBalance { balance } => player.set_balance( balance as f32 )?,
            PlayerAction::EmitLog { message } => player.emit_log( &message )?,
            PlayerAction::EmitError { code, message } => player.emit_error( &code, &message )?,
        }
        Ok( Value::Null )
    }


    /// Disposes every player.
    pub fn shutdown( &self ) {
        tracing::info!( "Shutting down {} player(s)", self.registry.len() );
        self.registry.dispose_all();
    }
}


#[cfg( test )]
mod tests {
    use super::*;
    use serde_json::json;
    use crate::testing::{ Call, MockFactory, RecordingSink };


    fn call( method: &str, args: Value ) -> MethodCall {
        MethodCall::new( PLAYER_CHANNEL, method, args )
    }


    fn router() -> ( CommandRouter, Arc<MockFactory>, Arc<RecordingSink> ) {
        let factory = MockFactory::new();
        let sink = RecordingSink::new();
        ( CommandRouter::new( factory.clone(), sink.clone() ), factory, sink )
    }


    #[test]
    fn test_parse_seek() {
        let cmd = Command::parse( &call( "seek", json!({ "playerId": "p1", "position": 5000 }) ) ).unwrap();
        assert_eq!(
            cmd,
            Command::Player { player_id: "p1".into(), action: PlayerAction::Seek { position_ms: 5000 } }
        );
    }


    #[test]
    fn test_parse_source_defaults_to_remote() {
        let cmd = Command::parse( &call( "setSourceUrl", json!({ "playerId": "p1", "url": "http://x/a.mp3" }) ) ).unwrap();
        assert_eq!(
            cmd,
            Command::Player {
                player_id: "p1".into(),
                action: PlayerAction::SetSourceUrl { url: "http://x/a.mp3".into(), is_local: false },
            }
        );
    }


    #[test]
    fn test_parse_missing_arg() {
        let err = Command::parse( &call( "setVolume", json!({ "playerId": "p1" }) ) ).unwrap_err();
        assert_eq!( err.code, CODE_INVALID_ARGUMENTS );

        let err = Command::parse( &call( "pause", json!({}) ) ).unwrap_err();
        assert_eq!( err.code, CODE_INVALID_ARGUMENTS );
    }


    #[test]
    fn test_parse_unknown() {
        let err = Command::parse( &call( "foobar", json!({ "playerId": "p1" }) ) ).unwrap_err();
        assert_eq!( err, CommandError::unimplemented() );

        let err = Command::parse( &MethodCall::new( "other", "pause", json!({}) ) ).unwrap_err();
        assert_eq!( err.code, CODE_UNIMPLEMENTED );
    }


    #[test]
    fn test_parse_listen() {
        let listen = MethodCall::new( "xyz.luan/audioplayers/events/p1", "listen", Value::Null );
        assert_eq!( Command::parse( &listen ).unwrap(), Command::Listen );
    }


    #[test]
    fn test_source_uri() {
        assert_eq!( source_uri( "/tmp/a.mp3", true ), "file:///tmp/a.mp3" );
        assert_eq!( source_uri( "file:///tmp/a.mp3", true ), "file:///tmp/a.mp3" );
        assert_eq!( source_uri( "http://x/a.mp3", false ), "http://x/a.mp3" );
    }


    #[test]
    fn test_unknown_player_errors_without_events() {
        let ( router, _factory, sink ) = router();
        for method in [ "pause", "resume", "stop", "release", "getDuration", "dispose" ] {
            let err = router.handle( &call( method, json!({ "playerId": "ghost" }) ) ).unwrap_err();
            assert_eq!( err.code, ERROR_CODE );
        }
        let err = router.handle( &call( "seek", json!({ "playerId": "ghost", "position": 10 }) ) ).unwrap_err();
        assert_eq!( err.code, ERROR_CODE );
        assert!( sink.events().is_empty() );
    }


    #[test]
    fn test_create_twice_builds_one_player() {
        let ( router, factory, _sink ) = router();
        router.handle( &call( "create", json!({ "playerId": "p1" }) ) ).unwrap();
        router.handle( &call( "create", json!({ "playerId": "p1" }) ) ).unwrap();
        assert_eq!( factory.built(), 1 );
    }


    #[test]
    fn test_double_dispose_errors() {
        let ( router, _factory, _sink ) = router();
        router.handle( &call( "create", json!({ "playerId": "p1" }) ) ).unwrap();

        assert_eq!( router.handle( &call( "dispose", json!({ "playerId": "p1" }) ) ).unwrap(), Value::Null );
        let err = router.handle( &call( "dispose", json!({ "playerId": "p1" }) ) ).unwrap_err();
        assert_eq!( err.code, ERROR_CODE );
        assert!( err.message.contains( "already been disposed" ) );
        assert!( !router.registry().contains( "p1" ) );
    }


    #[test]
    fn test_local_source_is_prefixed() {
        let ( router, factory, _sink ) = router();
        router.handle( &call( "create", json!({ "playerId": "p1" }) ) ).unwrap();
        router.handle( &call( "setSourceUrl", json!({ "playerId": "p1", "url": "/tmp/a.mp3", "isLocal": true }) ) )
            .unwrap();

        assert!( factory.last().calls().contains( &Call::SetUri( "file:///tmp/a.mp3".into() ) ) );
        let player = router.registry().get( "p1" ).unwrap();
        assert!( player.status().is_local_source );
    }


    #[test]
    fn test_release_mode_and_queries() {
        let ( router, _factory, _sink ) = router();
        router.handle( &call( "create", json!({ "playerId": "p1" }) ) ).unwrap();
        router.handle( &call( "setReleaseMode", json!({ "playerId": "p1", "releaseMode": "ReleaseMode.loop" }) ) )
            .unwrap();

        assert!( router.registry().get( "p1" ).unwrap().status().is_looping );
        assert_eq!(
            router.handle( &call( "getCurrentPosition", json!({ "playerId": "p1" }) ) ).unwrap(),
            Value::Null
        );
    }


    #[test]
    fn test_source_bytes_unimplemented() {
        let ( router, _factory, _sink ) = router();
        router.handle( &call( "create", json!({ "playerId": "p1" }) ) ).unwrap();
        let err = router.handle( &call( "setSourceBytes", json!({ "playerId": "p1", "bytes": [] }) ) ).unwrap_err();
        assert_eq!( err.code, CODE_UNIMPLEMENTED );
    }


    #[test]
    fn test_player_emit_log() {
        let ( router, _factory, sink ) = router();
        router.handle( &call( "create", json!({ "playerId": "p1" }) ) ).unwrap();
        router.handle( &call( "emitLog", json!({ "playerId": "p1", "message": "hello" }) ) ).unwrap();
        router.handle( &call( "emitError", json!({ "playerId": "p1", "code": "c", "message": "m" }) ) ).unwrap();

        let events = sink.events();
        assert_eq!( events[ 0 ], ( "xyz.luan/audioplayers/events/p1".to_string(), PlayerEvent::Log( "hello".into() ) ) );
        assert_eq!(
            events[ 1 ].1,
            PlayerEvent::Error { code: "c".into(), message: "m".into(), details: None }
        );
    }


    #[test]
    fn test_global_channel() {
        let ( router, _factory, sink ) = router();
        router.handle( &MethodCall::new( GLOBAL_CHANNEL, "emitLog", json!({ "message": "hi" }) ) ).unwrap();
        router.handle( &MethodCall::new( GLOBAL_CHANNEL, "setAudioContext", json!({}) ) ).unwrap();

        let events = sink.events();
        assert_eq!( events.len(), 2 );
        assert!( events.iter().all( |( channel, _ )| channel == GLOBAL_EVENT_CHANNEL ) );
        assert_eq!( events[ 0 ].1, PlayerEvent::Log( "hi".into() ) );
    }


    #[test]
    fn test_error_serialization_skips_empty_details() {
        let value = serde_json::to_value( CommandError::unimplemented() ).unwrap();
        assert_eq!( value, json!({ "code": "unimplemented", "message": "method not implemented" }) );
    }
}
