//! Auplay CLI - command-line host for the audio player engine
//!
//! Reads JSON method calls, one per line, from stdin or a script and prints a
//! JSON response per call. Events from all players are printed as they occur.
//! With file arguments, plays them in sequence instead.

mod cli;
mod settings;
mod sink;

use std::fs::File;
use std::io::{ self, BufRead, BufReader };
use std::path::PathBuf;
use std::sync::mpsc::Receiver;
use std::sync::Arc;

use anyhow::{ Context, Result };
use clap::Parser;
use serde_json::{ json, Value };
use tracing_subscriber::EnvFilter;

use auplay_core::command::{ CommandError, PLAYER_CHANNEL };
use auplay_core::player::EVENT_CHANNEL_PREFIX;
use auplay_core::{ CommandRouter, LocalPlaybinFactory, MethodCall, PlayerEvent };

use cli::Args;
use settings::Settings;
use sink::StdoutSink;


const CLI_PLAYER: &str = "cli";


/// Turns one request line into a response line.
///
/// The optional `id` of the request is echoed back.
fn respond( router: &CommandRouter, line: &str ) -> Value {
    let request: Value = match serde_json::from_str( line ) {
        Ok( request ) => request,
        Err( e ) => {
            let error = CommandError::invalid_arguments( format!( "Malformed request: {}", e ) );
            return json!({ "id": Value::Null, "error": error });
        }
    };
    let id = request.get( "id" ).cloned().unwrap_or( Value::Null );

    let result = serde_json::from_value::<MethodCall>( request )
        .map_err( |e| CommandError::invalid_arguments( format!( "Malformed request: {}", e ) ) )
        .and_then( |call| router.handle( &call ) );

    match result {
        Ok( value ) => json!({ "id": id, "result": value }),
        Err( error ) => json!({ "id": id, "error": error }),
    }
}


fn run_requests( router: &CommandRouter, sink: &StdoutSink, input: impl BufRead ) -> Result<()> {
    for line in input.lines() {
        let line = line.context( "Failed to read request" )?;
        let line = line.trim();
        if line.is_empty() || line.starts_with( '#' ) {
            continue;
        }
        sink.write_line( &respond( router, line ) );
    }
    Ok(())
}


fn call( router: &CommandRouter, method: &str, args: Value ) -> Result<Value> {
    let value = router.handle( &MethodCall::new( PLAYER_CHANNEL, method, args ) )
        .with_context( || format!( "{} failed", method ) )?;
    Ok( value )
}


/// Discards events left over from an earlier source.
fn drain_stale( events: &Receiver<( String, PlayerEvent )> ) -> usize {
    let stale = events.try_iter().count();
    if stale > 0 {
        tracing::debug!( "Dropped {} stale events", stale );
    }
    stale
}


/// Blocks until the player finishes the current source or reports an error.
fn wait_for_end( events: &Receiver<( String, PlayerEvent )>, channel: &str ) -> Result<()> {
    loop {
        let ( from, event ) = events.recv().context( "Event stream closed" )?;
        if from != channel {
            continue;
        }
        match event {
            PlayerEvent::Complete => return Ok(()),
            PlayerEvent::Error { message, details, .. } => {
                tracing::error!( "{} ({})", message, details.unwrap_or_default() );
                return Ok(());
            }
            _ => {}
        }
    }
}


fn play_files(
    router: &CommandRouter,
    events: &Receiver<( String, PlayerEvent )>,
    files: &[PathBuf],
) -> Result<()> {
    let channel = format!( "{}{}", EVENT_CHANNEL_PREFIX, CLI_PLAYER );
    call( router, "create", json!({ "playerId": CLI_PLAYER }) )?;

    for file in files {
        let path = file
            .canonicalize()
            .with_context( || format!( "Cannot open {}", file.display() ) )?;
        tracing::info!( "Playing {}", path.display() );
        drain_stale( events );

        call( router, "setSourceUrl", json!({
            "playerId": CLI_PLAYER,
            "url": path.to_string_lossy(),
            "isLocal": true,
        }))?;
        call( router, "resume", json!({ "playerId": CLI_PLAYER }) )?;
        wait_for_end( events, &channel )?;
    }

    call( router, "dispose", json!({ "playerId": CLI_PLAYER }) )?;
    Ok(())
}


fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter( EnvFilter::try_from_default_env().unwrap_or_else( |_| {
            EnvFilter::new( "info,auplay_core=info" )
        }))
        .with_writer( io::stderr )
        .init();

    let mut settings = Settings::load_from( args.settings.as_deref() );
    if args.no_balance {
        settings.balance_enabled = false;
    }
    if args.write_settings {
        let path = settings.save_to( args.settings.as_deref() )?;
        tracing::info!( "Saved settings to {}", path.display() );
    }

    let factory = Arc::new( LocalPlaybinFactory::new( settings.playbin_options() ) );

    let result = if !args.files.is_empty() {
        let ( sink, events ) = StdoutSink::forwarding();
        let router = CommandRouter::new( factory, sink );
        let result = play_files( &router, &events, &args.files );
        router.shutdown();
        result
    } else {
        let sink = StdoutSink::new();
        let router = CommandRouter::new( factory, sink.clone() );
        let result = match args.script.as_ref() {
            Some( script ) => File::open( script )
                .with_context( || format!( "Cannot open script {}", script.display() ) )
                .and_then( |file| run_requests( &router, &sink, BufReader::new( file ) ) ),
            None => run_requests( &router, &sink, io::stdin().lock() ),
        };
        router.shutdown();
        result
    };

    result
}


#[cfg( test )]
mod tests {
    use super::*;
    use auplay_core::{ Bus, Pipeline, PipelineError };


    fn router() -> CommandRouter {
        let sink = StdoutSink::new();
        let factory = |_bus: Bus| -> Result<Box<dyn Pipeline>, PipelineError> {
            Err( PipelineError::ElementCreation( "audio sink".into() ) )
        };
        CommandRouter::new( Arc::new( factory ), sink )
    }


    #[test]
    fn test_respond_echoes_id() {
        let router = router();
        let response = respond(
            &router,
            r#"{ "id": 7, "channel": "xyz.luan/audioplayers.global", "method": "emitLog", "args": { "message": "hi" } }"#,
        );
        assert_eq!( response, json!({ "id": 7, "result": null }) );
    }


    #[test]
    fn test_respond_malformed() {
        let router = router();
        let response = respond( &router, "not json" );
        assert_eq!( response[ "error" ][ "code" ], "invalid_arguments" );

        let response = respond( &router, r#"{ "id": 1, "method": "pause" }"# );
        assert_eq!( response[ "id" ], 1 );
        assert_eq!( response[ "error" ][ "code" ], "invalid_arguments" );
    }


    #[test]
    fn test_respond_unknown_player() {
        let router = router();
        let response = respond(
            &router,
            r#"{ "channel": "xyz.luan/audioplayers", "method": "pause", "args": { "playerId": "p1" } }"#,
        );
        assert_eq!( response[ "error" ][ "code" ], "LinuxAudioError" );
    }


    #[test]
    fn test_create_failure_is_reported() {
        let router = router();
        let response = respond(
            &router,
            r#"{ "channel": "xyz.luan/audioplayers", "method": "create", "args": { "playerId": "p1" } }"#,
        );
        assert_eq!( response[ "error" ][ "message" ], "Failed to create player" );
        assert_eq!( response[ "error" ][ "details" ], "Not all elements could be created: audio sink" );
    }


    #[test]
    fn test_drain_stale_events() {
        let ( tx, rx ) = std::sync::mpsc::channel();
        tx.send(( "c".to_string(), PlayerEvent::Error { code: "x".into(), message: "late".into(), details: None } )).unwrap();
        tx.send(( "c".to_string(), PlayerEvent::Complete )).unwrap();

        assert_eq!( drain_stale( &rx ), 2 );
        assert_eq!( drain_stale( &rx ), 0 );

        tx.send(( "c".to_string(), PlayerEvent::Complete )).unwrap();
        wait_for_end( &rx, "c" ).unwrap();
    }
}
