//! Audio player
//!
//! One [`AudioPlayer`] per player id. It owns a pipeline (through
//! [`PipelineHandle`]) and the thread servicing that pipeline's bus, keeps the
//! host's desired playback state, and turns bus messages into host events.
//!
//! All mutable state sits behind a single mutex. Commands lock it on the
//! caller's thread, bus messages lock it on the player thread.

use std::sync::{ Arc, Mutex, MutexGuard, PoisonError, Weak };

use thiserror::Error;

use crate::event::{ EventSink, PlayerEvent };
use crate::handle::{ PipelineHandle, SourceBinding };
use crate::pipeline::{ BusMessage, MediaError, ErrorDomain, PipelineError, PipelineFactory, PipelineState, StateChange };
use crate::thread::PlayerThread;


/// Prefix of every player's event channel name.
pub const EVENT_CHANNEL_PREFIX: &str = "xyz.luan/audioplayers/events/";

/// Error code identifying this platform in host-visible errors.
pub const ERROR_CODE: &str = "LinuxAudioError";

const TROUBLESHOOTING_URL: &str =
    "https://github.com/bluefireteam/audioplayers/blob/main/troubleshooting.md";


/// Message used when a source could not be loaded.
pub fn source_error_message() -> String {
    format!( "Failed to set source. For troubleshooting, see: {}", TROUBLESHOOTING_URL )
}


const UNKNOWN_ERROR_MESSAGE: &str = "Unknown GstGError. See details.";
const READY_TO_PAUSED_FAILED: &str = "Unable to set the pipeline from READY to PAUSED.";


/// Errors returned by player commands.
#[derive( Debug, Error )]
pub enum PlayerError {
    #[error( "Player was already disposed" )]
    Disposed,

    #[error( transparent )]
    Pipeline( #[from] PipelineError ),

    #[error( "Unable to seek playback to '0' while stopping the player." )]
    StopRewind,
}


/// Snapshot of a player's state flags.
#[derive( Debug, Clone, PartialEq )]
pub struct PlayerStatus {
    pub source_url: String,
    pub is_local_source: bool,
    pub is_initialized: bool,
    pub is_playing: bool,
    pub is_looping: bool,
    pub is_seek_completed: bool,
    pub playback_rate: f64,
    pub player_mode: String,
    pub buffering_percent: i32,
    pub disposed: bool,
}


struct Emitter {
    channel: String,
    sink: Arc<dyn EventSink>,
}


impl Emitter {
    fn emit( &self, event: PlayerEvent ) {
        self.sink.emit( &self.channel, &event );
    }


    fn error( &self, message: impl Into<String>, details: Option<String> ) {
        let message = message.into();
        tracing::warn!( "[{}] error: {} {:?}", self.channel, message, details );
        self.emit( PlayerEvent::Error { code: ERROR_CODE.to_string(), message, details } );
    }
}


/// Mutable player state, guarded by the player's mutex.
struct PlayerCore {
    id: String,
    events: Emitter,
    /// `None` once disposed.
    handle: Option<PipelineHandle>,
    is_local_source: bool,
    is_initialized: bool,
    is_playing: bool,
    is_looping: bool,
    is_seek_completed: bool,
    playback_rate: f64,
    player_mode: String,
    buffering_percent: i32,
}


impl PlayerCore {
    fn handle( &mut self ) -> Result<&mut PipelineHandle, PlayerError> {
        self.handle.as_mut().ok_or( PlayerError::Disposed )
    }


    fn set_source_url( &mut self, url: &str, is_local: bool ) -> Result<(), PlayerError> {
        let binding = self.handle()?.bind_source( url )?;
        if binding == SourceBinding::Unchanged {
            self.on_prepared( true );
            return Ok(());
        }
        self.is_local_source = is_local;
        self.is_initialized = false;
        self.is_playing = false;
        // A rebound pipeline was flushed, nothing can still be pending
        self.is_seek_completed = true;
        Ok(())
    }


    fn release_source( &mut self ) -> Result<(), PlayerError> {
        self.handle()?.release_source()?;
        self.is_playing = false;
        self.is_initialized = false;
        self.is_seek_completed = true;
        Ok(())
    }


    /// Seeks and/or changes rate. A rate of 0 pauses instead.
    fn set_playback( &mut self, position_ms: i64, rate: f64 ) -> Result<(), PlayerError> {
        self.handle()?;
        if rate != 0.0 {
            self.playback_rate = rate;
        }
        if !self.is_initialized {
            return Ok(());
        }
        if !self.is_seek_completed {
            tracing::debug!( "[{}] seek already in flight, ignoring {} ms @ {}", self.id, position_ms, rate );
            return Ok(());
        }
        if rate == 0.0 {
            return self.pause();
        }

        self.is_seek_completed = false;
        if !self.handle()?.seek_or_set_rate( position_ms, rate ) {
            let message = format!(
                "Could not set playback to position {} and rate {}.",
                position_ms,
                rate
            );
            tracing::warn!( "[{}] {}", self.id, message );
            self.events.emit( PlayerEvent::Log( message ) );
            self.is_seek_completed = true;
        }
        Ok(())
    }


    fn set_position( &mut self, position_ms: i64 ) -> Result<(), PlayerError> {
        self.handle()?;
        if !self.is_initialized {
            return Ok(());
        }
        let rate = self.playback_rate;
        self.set_playback( position_ms, rate )
    }


    fn set_playback_rate( &mut self, rate: f64 ) -> Result<(), PlayerError> {
        let position = self.position()?.unwrap_or( 0 );
        self.set_playback( position, rate )
    }


    fn position( &mut self ) -> Result<Option<i64>, PlayerError> {
        let initialized = self.is_initialized;
        let handle = self.handle()?;
        Ok( if initialized { handle.query_position() } else { None } )
    }


    fn duration( &mut self ) -> Result<Option<i64>, PlayerError> {
        let initialized = self.is_initialized;
        let handle = self.handle()?;
        Ok( if initialized { handle.query_duration() } else { None } )
    }


    fn play( &mut self ) -> Result<(), PlayerError> {
        self.set_position( 0 )?;
        self.resume()
    }


    fn pause( &mut self ) -> Result<(), PlayerError> {
        self.handle()?;
        self.is_playing = false;
        if !self.is_initialized {
            return Ok(());
        }
        self.handle()?.set_state( PipelineState::Paused )?;
        Ok(())
    }


    fn resume( &mut self ) -> Result<(), PlayerError> {
        self.handle()?;
        self.is_playing = true;
        if !self.is_initialized {
            return Ok(());
        }
        if self.handle()?.set_state( PipelineState::Playing )? == StateChange::Success {
            // No bus message reports the duration at this point
            self.on_duration_update();
        }
        Ok(())
    }


    /// Pauses and rewinds to 0, blocking until the pipeline settles.
    fn stop( &mut self ) -> Result<(), PlayerError> {
        self.pause()?;
        if !self.is_initialized {
            return Ok(());
        }
        self.set_position( 0 )?;
        self.handle()?.wait_settled().map_err( |_| PlayerError::StopRewind )?;
        Ok(())
    }


    fn set_volume( &mut self, volume: f64 ) -> Result<(), PlayerError> {
        self.handle()?.set_volume( volume );
        Ok(())
    }


    fn set_balance( &mut self, balance: f32 ) -> Result<(), PlayerError> {
        if !self.handle()?.set_balance( balance ) {
            tracing::debug!( "[{}] no balance stage, ignoring balance {}", self.id, balance );
            self.events.emit( PlayerEvent::Log( "Audiopanorama was not initialized".into() ) );
        }
        Ok(())
    }


    fn dispose( &mut self ) -> Result<(), PlayerError> {
        if self.handle.is_none() {
            return Err( PlayerError::Disposed );
        }
        if let Err( e ) = self.release_source() {
            tracing::warn!( "[{}] releasing source on dispose failed: {}", self.id, e );
        }
        if let Some( handle ) = self.handle.take() {
            handle.teardown();
        }
        self.is_playing = false;
        self.is_initialized = false;
        Ok(())
    }


    fn on_bus_message( &mut self, message: BusMessage ) {
        if self.handle.is_none() {
            tracing::debug!( "[{}] disposed, dropping {:?}", self.id, message );
            return;
        }

        let from_pipeline = message.from_pipeline();
        match message {
            BusMessage::Error { error, .. } => self.on_media_error( &error ),
            BusMessage::StateChanged { old, new, .. } if from_pipeline => {
                self.on_state_changed( old, new );
            }
            BusMessage::Eos { .. } if from_pipeline => {
                if self.is_playing {
                    self.on_playback_ended();
                }
            }
            BusMessage::DurationChanged { .. } => self.on_duration_update(),
            BusMessage::NewClock { .. } if from_pipeline => self.on_duration_update(),
            BusMessage::AsyncDone { .. } if from_pipeline => {
                if !self.is_seek_completed {
                    self.events.emit( PlayerEvent::SeekComplete );
                    self.is_seek_completed = true;
                }
            }
            BusMessage::Buffering { percent, .. } => {
                tracing::debug!( "[{}] buffering {}%", self.id, percent );
                self.buffering_percent = percent;
            }
            BusMessage::Tag { tags, .. } => {
                for ( tag, value ) in tags {
                    tracing::debug!( "[{}] tag {} - {}", self.id, tag, value );
                }
            }
            other => {
                tracing::trace!( "[{}] ignoring {:?}", self.id, other );
            }
        }
    }


    fn on_state_changed( &mut self, old: PipelineState, new: PipelineState ) {
        // Only act on transitions that still describe the pipeline; stale
        // ones are left over from a source change or release.
        let current = match self.handle.as_ref() {
            Some( handle ) => handle.current_state(),
            None => return,
        };
        tracing::debug!( "[{}] state {} -> {} (now {})", self.id, old, new, current );

        if new == PipelineState::Ready {
            if current == PipelineState::Ready {
                // PAUSED makes the pipeline queryable and seekable
                let result = match self.handle.as_mut() {
                    Some( handle ) => handle.set_state( PipelineState::Paused ),
                    None => return,
                };
                if result.is_err() {
                    if self.is_initialized {
                        self.events.error( READY_TO_PAUSED_FAILED, None );
                    } else {
                        self.events.error( source_error_message(), Some( READY_TO_PAUSED_FAILED.into() ) );
                    }
                }
            }
            self.is_initialized = false;
        } else if old == PipelineState::Paused && new == PipelineState::Playing {
            self.on_duration_update();
        } else if new >= PipelineState::Paused {
            if !self.is_initialized && current >= PipelineState::Paused {
                self.is_initialized = true;
                self.on_prepared( true );
                if self.is_playing {
                    if let Err( e ) = self.resume() {
                        self.events.error( e.to_string(), None );
                    }
                }
            }
        } else if self.is_initialized {
            self.is_initialized = false;
        }
    }


    fn on_prepared( &self, prepared: bool ) {
        tracing::info!( "[{}] prepared", self.id );
        self.events.emit( PlayerEvent::Prepared( prepared ) );
    }


    fn on_duration_update( &mut self ) {
        let duration = match self.handle.as_ref() {
            Some( handle ) => handle.query_duration().unwrap_or( 0 ),
            None => return,
        };
        self.events.emit( PlayerEvent::Duration( duration ) );
    }


    fn on_playback_ended( &mut self ) {
        tracing::info!( "[{}] playback ended (looping: {})", self.id, self.is_looping );
        self.events.emit( PlayerEvent::Complete );

        let result = if self.is_looping { self.play() } else { self.stop() };
        if let Err( e ) = result {
            self.events.error( e.to_string(), None );
        }
    }


    fn on_media_error( &self, error: &MediaError ) {
        let message = if error.domain == ErrorDomain::Stream {
            source_error_message()
        } else {
            UNKNOWN_ERROR_MESSAGE.to_string()
        };
        self.events.error( message, Some( error.details() ) );
    }


    fn status( &self ) -> PlayerStatus {
        PlayerStatus {
            source_url: self.handle.as_ref().map( |h| h.uri().to_string() ).unwrap_or_default(),
            is_local_source: self.is_local_source,
            is_initialized: self.is_initialized,
            is_playing: self.is_playing,
            is_looping: self.is_looping,
            is_seek_completed: self.is_seek_completed,
            playback_rate: self.playback_rate,
            player_mode: self.player_mode.clone(),
            buffering_percent: self.buffering_percent,
            disposed: self.handle.is_none(),
        }
    }
}


/// A single audio player.
pub struct AudioPlayer {
    id: String,
    channel: String,
    core: Mutex<PlayerCore>,
    thread: Mutex<Option<PlayerThread>>,
}


impl AudioPlayer {
    /// Creates the player, its thread and its pipeline.
    ///
    /// Blocks until the pipeline has been built on the player thread.
    pub fn new(
        id: &str,
        factory: Arc<dyn PipelineFactory>,
        sink: Arc<dyn EventSink>,
    ) -> Result<Arc<Self>, PlayerError> {
        let ( mut thread, pipeline ) = PlayerThread::spawn( id, factory )?;
        let channel = format!( "{}{}", EVENT_CHANNEL_PREFIX, id );

        let player = Arc::new( Self {
            id: id.to_string(),
            channel: channel.clone(),
            core: Mutex::new( PlayerCore {
                id: id.to_string(),
                events: Emitter { channel, sink },
                handle: Some( PipelineHandle::new( pipeline ) ),
                is_local_source: false,
                is_initialized: false,
                is_playing: false,
                is_looping: false,
                is_seek_completed: true,
                playback_rate: 1.0,
                player_mode: String::new(),
                buffering_percent: 0,
            }),
            thread: Mutex::new( None ),
        });

        // Attached only once the player exists, so no message is lost
        let weak: Weak<AudioPlayer> = Arc::downgrade( &player );
        thread.attach( move |message| {
            if let Some( player ) = weak.upgrade() {
                player.lock().on_bus_message( message );
            }
        });
        *player.thread.lock().unwrap_or_else( PoisonError::into_inner ) = Some( thread );

        tracing::info!( "Created player {}", id );
        Ok( player )
    }


    fn lock( &self ) -> MutexGuard<'_, PlayerCore> {
        self.core.lock().unwrap_or_else( PoisonError::into_inner )
    }


    pub fn id( &self ) -> &str {
        &self.id
    }


    /// Name of the channel this player's events are emitted on.
    pub fn event_channel( &self ) -> &str {
        &self.channel
    }


    pub fn status( &self ) -> PlayerStatus {
        self.lock().status()
    }


    pub fn is_disposed( &self ) -> bool {
        self.lock().handle.is_none()
    }


    /// Binds a source URL. The caller applies any `file://` prefix.
    pub fn set_source_url( &self, url: &str, is_local: bool ) -> Result<(), PlayerError> {
        tracing::debug!( "[{}] set source {} (local: {})", self.id, url, is_local );
        self.lock().set_source_url( url, is_local )
    }


    pub fn release( &self ) -> Result<(), PlayerError> {
        self.lock().release_source()
    }


    /// Seeks to 0 and resumes.
    pub fn play( &self ) -> Result<(), PlayerError> {
        self.lock().play()
    }


    pub fn pause( &self ) -> Result<(), PlayerError> {
        self.lock().pause()
    }


    /// Requests playback. Remembered until the source is ready.
    pub fn resume( &self ) -> Result<(), PlayerError> {
        self.lock().resume()
    }


    /// Pauses and rewinds to 0. Blocks until the pipeline has settled.
    pub fn stop( &self ) -> Result<(), PlayerError> {
        self.lock().stop()
    }


    pub fn seek( &self, position_ms: i64 ) -> Result<(), PlayerError> {
        self.lock().set_position( position_ms )
    }


    pub fn set_playback_rate( &self, rate: f64 ) -> Result<(), PlayerError> {
        self.lock().set_playback_rate( rate )
    }


    /// Current position in milliseconds, if it can be queried.
    pub fn position( &self ) -> Result<Option<i64>, PlayerError> {
        self.lock().position()
    }


    /// Duration in milliseconds, if known.
    pub fn duration( &self ) -> Result<Option<i64>, PlayerError> {
        self.lock().duration()
    }


    pub fn set_volume( &self, volume: f64 ) -> Result<(), PlayerError> {
        self.lock().set_volume( volume )
    }


    pub fn set_balance( &self, balance: f32 ) -> Result<(), PlayerError> {
        self.lock().set_balance( balance )
    }


    pub fn set_looping( &self, looping: bool ) -> Result<(), PlayerError> {
        let mut core = self.lock();
        core.handle()?;
        core.is_looping = looping;
        Ok(())
    }


    /// Applies a release mode; any mode containing "loop" loops.
    pub fn set_release_mode( &self, mode: &str ) -> Result<(), PlayerError> {
        self.set_looping( mode.contains( "loop" ) )
    }


    pub fn set_player_mode( &self, mode: &str ) -> Result<(), PlayerError> {
        let mut core = self.lock();
        core.handle()?;
        tracing::debug!( "[{}] player mode {}", self.id, mode );
        core.player_mode = mode.to_string();
        Ok(())
    }


    /// Emits a log event on this player's channel.
    pub fn emit_log( &self, message: &str ) -> Result<(), PlayerError> {
        let core = self.lock();
        core.events.emit( PlayerEvent::Log( message.to_string() ) );
        Ok(())
    }


    /// Emits an error event on this player's channel.
    pub fn emit_error( &self, code: &str, message: &str ) -> Result<(), PlayerError> {
        let core = self.lock();
        core.events.emit( PlayerEvent::Error {
            code: code.to_string(),
            message: message.to_string(),
            details: None,
        });
        Ok(())
    }


    /// Releases the source, tears the pipeline down and stops the player thread.
    ///
    /// A second call fails with [`PlayerError::Disposed`].
    pub fn dispose( &self ) -> Result<(), PlayerError> {
        self.lock().dispose()?;

        // Outside the state lock: the thread may be waiting on it
        let thread = self.thread.lock().unwrap_or_else( PoisonError::into_inner ).take();
        if let Some( mut thread ) = thread {
            thread.stop();
        }
        tracing::info!( "Disposed player {}", self.id );
        Ok(())
    }
}


impl Drop for AudioPlayer {
    fn drop( &mut self ) {
        let core = self.core.get_mut().unwrap_or_else( PoisonError::into_inner );
        if core.handle.is_some() {
            let _ = core.dispose();
        }
    }
}


#[cfg( test )]
mod tests {
    use super::*;
    use std::time::Duration;
    use crate::pipeline::MessageSource;
    use crate::testing::{ wait_until, Call, MockControl, MockFactory, RecordingSink };


    const URL: &str = "file:///tmp/a.mp3";


    fn new_player( factory: &Arc<MockFactory> ) -> ( Arc<AudioPlayer>, Arc<RecordingSink>, Arc<MockControl> ) {
        let sink = RecordingSink::new();
        let player = AudioPlayer::new( "p1", factory.clone(), sink.clone() ).unwrap();
        ( player, sink, factory.last() )
    }


    fn prepared_player() -> ( Arc<AudioPlayer>, Arc<RecordingSink>, Arc<MockControl> ) {
        let ( player, sink, control ) = new_player( &MockFactory::new() );
        player.set_source_url( URL, false ).unwrap();
        assert!( sink.wait_for( |e| *e == PlayerEvent::Prepared( true ) ) );
        assert!( wait_until( || player.status().is_initialized ) );
        ( player, sink, control )
    }


    /// Waits until every message posted so far has been handled.
    fn flush( player: &AudioPlayer, control: &MockControl, marker: i32 ) {
        control.post( BusMessage::Buffering { source: MessageSource::Pipeline, percent: marker } );
        assert!( wait_until( || player.status().buffering_percent == marker ) );
    }


    fn is_duration( event: &PlayerEvent ) -> bool {
        matches!( event, PlayerEvent::Duration( _ ) )
    }


    #[test]
    fn test_prepare_then_resume_reports_duration() {
        let ( player, sink, control ) = new_player( &MockFactory::new() );
        control.set_duration( Some( Duration::from_millis( 42_000 ) ) );

        player.set_source_url( URL, false ).unwrap();
        assert!( sink.wait_for( |e| *e == PlayerEvent::Prepared( true ) ) );
        assert!( wait_until( || player.status().is_initialized ) );
        assert_eq!( control.last_state_request(), Some( PipelineState::Paused ) );

        player.resume().unwrap();
        assert!( sink.wait_for( |e| *e == PlayerEvent::Duration( 42_000 ) ) );
        assert_eq!( control.last_state_request(), Some( PipelineState::Playing ) );
        assert_eq!( player.event_channel(), "xyz.luan/audioplayers/events/p1" );
    }


    #[test]
    fn test_same_source_reports_prepared_again() {
        let ( player, sink, control ) = prepared_player();
        let calls = control.calls().len();

        player.set_source_url( URL, false ).unwrap();
        assert_eq!( sink.count( |e| *e == PlayerEvent::Prepared( true ) ), 2 );
        assert_eq!( control.calls().len(), calls );
    }


    #[test]
    fn test_deferred_resume_starts_after_prepare() {
        let ( player, sink, control ) = new_player( &MockFactory::new() );

        player.resume().unwrap();
        assert!( player.status().is_playing );
        assert!( !control.calls().contains( &Call::SetState( PipelineState::Playing ) ) );

        player.set_source_url( URL, false ).unwrap();
        // set_source_url clears the request, so ask again before the source is ready
        player.resume().unwrap();

        assert!( sink.wait_for( is_duration ) );
        assert!( control.calls().contains( &Call::SetState( PipelineState::Playing ) ) );
    }


    #[test]
    fn test_overlapping_seek_is_dropped() {
        let ( player, sink, control ) = prepared_player();
        player.resume().unwrap();

        player.seek( 5000 ).unwrap();
        player.seek( 6000 ).unwrap();
        player.set_playback_rate( 2.0 ).unwrap();

        let seeks = control.seeks();
        assert_eq!( seeks.len(), 1 );
        assert_eq!( seeks[ 0 ].start, Duration::from_millis( 5000 ) );
        assert!( !player.status().is_seek_completed );
        // The rate is remembered even though no request went out
        assert_eq!( player.status().playback_rate, 2.0 );

        control.post_async_done();
        assert!( sink.wait_for( |e| *e == PlayerEvent::SeekComplete ) );
        assert!( wait_until( || player.status().is_seek_completed ) );

        control.post_async_done();
        flush( &player, &control, 7 );
        assert_eq!( sink.count( |e| *e == PlayerEvent::SeekComplete ), 1 );

        player.seek( 6000 ).unwrap();
        assert_eq!( control.seeks().len(), 2 );
    }


    #[test]
    fn test_preroll_settle_does_not_complete_first_seek() {
        let ( player, sink, control ) = new_player( &MockFactory::new() );
        control.settle_preroll( true );

        player.set_source_url( URL, false ).unwrap();
        assert!( sink.wait_for( |e| *e == PlayerEvent::Prepared( true ) ) );
        assert!( wait_until( || player.status().is_initialized ) );

        // The host seeks as soon as it sees the source prepared
        player.seek( 5000 ).unwrap();
        flush( &player, &control, 3 );
        assert_eq!( sink.count( |e| *e == PlayerEvent::SeekComplete ), 0 );
        assert!( !player.status().is_seek_completed );

        player.seek( 6000 ).unwrap();
        assert_eq!( control.seeks().len(), 1 );

        control.post_async_done();
        assert!( sink.wait_for( |e| *e == PlayerEvent::SeekComplete ) );
        assert!( wait_until( || player.status().is_seek_completed ) );
    }


    #[test]
    fn test_seek_before_prepare_is_noop() {
        let ( player, _sink, control ) = new_player( &MockFactory::new() );
        player.seek( 1000 ).unwrap();
        player.set_playback_rate( 1.5 ).unwrap();

        assert!( control.seeks().is_empty() );
        assert_eq!( player.position().unwrap(), None );
        assert_eq!( player.duration().unwrap(), None );
        assert_eq!( player.status().playback_rate, 1.5 );
    }


    #[test]
    fn test_rate_zero_pauses() {
        let ( player, _sink, control ) = prepared_player();
        player.resume().unwrap();

        player.set_playback_rate( 0.0 ).unwrap();

        assert!( control.seeks().is_empty() );
        assert_eq!( control.last_state_request(), Some( PipelineState::Paused ) );
        assert!( !player.status().is_playing );
        assert_eq!( player.status().playback_rate, 1.0 );
    }


    #[test]
    fn test_reverse_rate_uses_bounded_segment() {
        let ( player, _sink, control ) = prepared_player();
        control.set_position( Some( Duration::from_millis( 3000 ) ) );

        player.set_playback_rate( -1.0 ).unwrap();

        let seeks = control.seeks();
        assert_eq!( seeks.len(), 1 );
        assert_eq!( seeks[ 0 ].start, Duration::ZERO );
        assert_eq!( seeks[ 0 ].stop, Some( Duration::from_millis( 3000 ) ) );
        assert_eq!( seeks[ 0 ].rate, -1.0 );
    }


    #[test]
    fn test_rejected_seek_does_not_block_later_seeks() {
        let ( player, sink, control ) = prepared_player();
        control.fail_seek( true );

        player.seek( 1000 ).unwrap();
        assert!( player.status().is_seek_completed );
        assert!( sink.wait_for( |e| matches!( e, PlayerEvent::Log( m ) if m.contains( "1000" ) ) ) );

        control.fail_seek( false );
        player.seek( 2000 ).unwrap();
        assert_eq!( control.seeks().len(), 2 );
    }


    #[test]
    fn test_end_of_stream_loops() {
        let ( player, sink, control ) = prepared_player();
        player.set_release_mode( "ReleaseMode.loop" ).unwrap();
        player.resume().unwrap();

        control.post_eos();
        flush( &player, &control, 11 );

        assert_eq!( sink.count( |e| *e == PlayerEvent::Complete ), 1 );
        let seeks = control.seeks();
        assert_eq!( seeks.len(), 1 );
        assert_eq!( seeks[ 0 ].start, Duration::ZERO );
        assert_eq!( control.last_state_request(), Some( PipelineState::Playing ) );
        assert!( player.status().is_playing );
    }


    #[test]
    fn test_end_of_stream_stops_without_loop() {
        let ( player, sink, control ) = prepared_player();
        player.set_release_mode( "ReleaseMode.release" ).unwrap();
        player.resume().unwrap();

        control.post_eos();
        flush( &player, &control, 12 );

        assert_eq!( sink.count( |e| *e == PlayerEvent::Complete ), 1 );
        let seeks = control.seeks();
        assert_eq!( seeks.len(), 1 );
        assert_eq!( seeks[ 0 ].start, Duration::ZERO );
        assert_eq!( control.last_state_request(), Some( PipelineState::Paused ) );
        assert!( control.calls().contains( &Call::WaitSettled ) );
        assert!( !player.status().is_playing );
    }


    #[test]
    fn test_end_of_stream_ignored_when_not_playing() {
        let ( player, sink, control ) = prepared_player();
        control.post_eos();
        control.post( BusMessage::Eos { source: MessageSource::Element( "decodebin".into() ) } );
        flush( &player, &control, 13 );
        assert_eq!( sink.count( |e| *e == PlayerEvent::Complete ), 0 );
    }


    #[test]
    fn test_stream_error_is_source_error() {
        let ( player, sink, control ) = new_player( &MockFactory::new() );
        control.post( BusMessage::Error {
            source: MessageSource::Element( "decodebin".into() ),
            error: MediaError::new( ErrorDomain::Stream, 4, "Could not determine type of stream." ),
        });
        control.post( BusMessage::Error {
            source: MessageSource::Element( "source".into() ),
            error: MediaError::new( ErrorDomain::Resource, 3, "File not found." ),
        });
        flush( &player, &control, 14 );

        let errors: Vec<_> = sink.events().into_iter().map( |( _, e )| e ).filter( PlayerEvent::is_error ).collect();
        assert_eq!(
            errors,
            vec![
                PlayerEvent::Error {
                    code: ERROR_CODE.into(),
                    message: source_error_message(),
                    details: Some( "Could not determine type of stream. (Domain: stream-error, Code: 4)".into() ),
                },
                PlayerEvent::Error {
                    code: ERROR_CODE.into(),
                    message: UNKNOWN_ERROR_MESSAGE.into(),
                    details: Some( "File not found. (Domain: resource-error, Code: 3)".into() ),
                },
            ]
        );
    }


    #[test]
    fn test_failed_preroll_reports_source_error() {
        let ( player, sink, control ) = new_player( &MockFactory::new() );
        control.fail_state( PipelineState::Paused );

        player.set_source_url( URL, false ).unwrap();
        assert!( sink.wait_for( PlayerEvent::is_error ) );

        let errors: Vec<_> = sink.events().into_iter().map( |( _, e )| e ).filter( PlayerEvent::is_error ).collect();
        assert_eq!(
            errors[ 0 ],
            PlayerEvent::Error {
                code: ERROR_CODE.into(),
                message: source_error_message(),
                details: Some( READY_TO_PAUSED_FAILED.into() ),
            }
        );
        assert!( !player.status().is_initialized );
    }


    #[test]
    fn test_pause_failure_is_returned() {
        let ( player, _sink, control ) = prepared_player();
        player.resume().unwrap();
        control.fail_state( PipelineState::Paused );

        assert!( matches!( player.pause(), Err( PlayerError::Pipeline( PipelineError::StateChange( _ ) ) ) ) );
    }


    #[test]
    fn test_release_clears_source() {
        let ( player, _sink, control ) = prepared_player();
        player.resume().unwrap();
        player.release().unwrap();

        let status = player.status();
        assert_eq!( status.source_url, "" );
        assert!( !status.is_initialized );
        assert!( !status.is_playing );
        assert_eq!( control.last_state_request(), Some( PipelineState::Null ) );

        // Stale transitions left over from the release must not re-prepare
        flush( &player, &control, 15 );
        assert!( !player.status().is_initialized );
    }


    #[test]
    fn test_balance_without_stage_logs() {
        let ( player, sink, control ) = new_player( &MockFactory::without_balance() );
        player.set_balance( 0.3 ).unwrap();
        assert!( sink.wait_for( |e| matches!( e, PlayerEvent::Log( _ ) ) ) );
        assert!( !control.calls().iter().any( |c| matches!( c, Call::Balance( _ ) ) ) );
    }


    #[test]
    fn test_release_mode_parsing() {
        let ( player, _sink, _control ) = new_player( &MockFactory::new() );
        player.set_release_mode( "ReleaseMode.loop" ).unwrap();
        assert!( player.status().is_looping );
        player.set_release_mode( "ReleaseMode.stop" ).unwrap();
        assert!( !player.status().is_looping );
    }


    #[test]
    fn test_dispose_order_and_double_dispose() {
        let ( player, _sink, control ) = prepared_player();

        player.dispose().unwrap();
        let calls = control.calls();
        let tail = &calls[ calls.len() - 4.. ];
        assert_eq!(
            tail,
            &[
                Call::SetState( PipelineState::Null ),
                Call::DetachBus,
                Call::RemoveBalanceStage,
                Call::Dropped,
            ]
        );
        assert!( player.is_disposed() );
        assert!( matches!( player.dispose(), Err( PlayerError::Disposed ) ) );
        assert!( matches!( player.resume(), Err( PlayerError::Disposed ) ) );
    }


    #[test]
    fn test_messages_after_dispose_are_dropped() {
        let ( player, sink, control ) = prepared_player();
        player.resume().unwrap();
        let before = sink.events().len();

        player.dispose().unwrap();
        control.post_eos();
        std::thread::sleep( Duration::from_millis( 20 ) );
        assert_eq!( sink.events().len(), before );
    }
}
