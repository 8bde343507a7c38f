//! Event output
//!
//! Every emitted event becomes one JSON line on stdout:
//! `{"channel": <event channel>, "event": <event map>}`.

use std::io::{ self, Write };
use std::sync::mpsc::{ self, Receiver, Sender };
use std::sync::{ Arc, Mutex, PoisonError };

use auplay_core::{ EventSink, PlayerEvent };
use serde_json::{ json, Value };


pub struct StdoutSink {
    out: Mutex<io::Stdout>,
    /// Copies of every event, for a host that waits on them.
    forward: Option<Mutex<Sender<( String, PlayerEvent )>>>,
}


impl StdoutSink {
    pub fn new() -> Arc<Self> {
        Arc::new( Self { out: Mutex::new( io::stdout() ), forward: None } )
    }


    /// Creates the sink and the receiving end of its event copies.
    pub fn forwarding() -> ( Arc<Self>, Receiver<( String, PlayerEvent )> ) {
        let ( tx, rx ) = mpsc::channel();
        let sink = Arc::new( Self {
            out: Mutex::new( io::stdout() ),
            forward: Some( Mutex::new( tx ) ),
        });
        ( sink, rx )
    }


    /// Writes one line, never interleaved with event lines.
    pub fn write_line( &self, value: &Value ) {
        let out = self.out.lock().unwrap_or_else( PoisonError::into_inner );
        let mut out = out.lock();
        if writeln!( out, "{}", value ).and_then( |_| out.flush() ).is_err() {
            tracing::warn!( "stdout closed, dropping output" );
        }
    }
}


pub fn event_line( channel: &str, event: &PlayerEvent ) -> Value {
    json!({ "channel": channel, "event": event.to_message() })
}


impl EventSink for StdoutSink {
    fn emit( &self, channel: &str, event: &PlayerEvent ) {
        tracing::debug!( "{} <- {:?}", channel, event );
        self.write_line( &event_line( channel, event ) );
        if let Some( forward ) = self.forward.as_ref() {
            // The receiver may be gone during shutdown
            let _ = forward
                .lock()
                .unwrap_or_else( PoisonError::into_inner )
                .send(( channel.to_string(), event.clone() ));
        }
    }
}


#[cfg( test )]
mod tests {
    use super::*;


    #[test]
    fn test_event_line() {
        let line = event_line( "xyz.luan/audioplayers/events/p1", &PlayerEvent::Duration( 1500 ) );
        assert_eq!(
            line,
            json!({
                "channel": "xyz.luan/audioplayers/events/p1",
                "event": { "event": "audio.onDuration", "value": 1500 },
            })
        );
    }


    #[test]
    fn test_events_are_forwarded() {
        let ( sink, rx ) = StdoutSink::forwarding();
        sink.emit( "c", &PlayerEvent::Complete );
        assert_eq!( rx.try_recv().unwrap(), ( "c".to_string(), PlayerEvent::Complete ) );
    }


    #[test]
    fn test_plain_sink_keeps_no_copies() {
        let sink = StdoutSink::new();
        assert!( sink.forward.is_none() );
        sink.emit( "c", &PlayerEvent::Complete );
    }
}
