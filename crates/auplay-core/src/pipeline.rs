//! Pipeline boundary
//!
//! Every player drives its media engine through the [`Pipeline`] trait. The
//! engine reports back asynchronously by posting typed [`BusMessage`]s on a
//! [`Bus`]; the owning player thread drains them strictly in posting order.

use std::fmt;
use std::sync::atomic::{ AtomicBool, Ordering };
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;


/// Errors reported by a pipeline implementation.
#[derive( Debug, Error )]
pub enum PipelineError {
    #[error( "Not all elements could be created: {0}" )]
    ElementCreation( String ),

    #[error( "Unable to set the pipeline to {0}." )]
    StateChange( PipelineState ),

    #[error( "Player thread error: {0}" )]
    Thread( String ),
}


/// Playback state of a pipeline, in increasing order of readiness.
#[derive( Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default )]
pub enum PipelineState {
    #[default]
    Null,
    Ready,
    Paused,
    Playing,
}


impl PipelineState {
    /// The adjacent state one step towards `target`, or `self` when already there.
    pub fn step_towards( self, target: PipelineState ) -> PipelineState {
        use PipelineState::*;
        if target > self {
            match self {
                Null => Ready,
                Ready => Paused,
                Paused | Playing => Playing,
            }
        } else if target < self {
            match self {
                Playing => Paused,
                Paused => Ready,
                Ready | Null => Null,
            }
        } else {
            self
        }
    }
}


impl fmt::Display for PipelineState {
    fn fmt( &self, f: &mut fmt::Formatter<'_> ) -> fmt::Result {
        let name = match self {
            PipelineState::Null => "NULL",
            PipelineState::Ready => "READY",
            PipelineState::Paused => "PAUSED",
            PipelineState::Playing => "PLAYING",
        };
        write!( f, "{}", name )
    }
}


/// Outcome of a successful state change request.
#[derive( Debug, Clone, Copy, PartialEq, Eq )]
pub enum StateChange {
    /// The pipeline is already in the requested state.
    Success,
    /// The change was accepted and completes later; a bus message follows.
    Async,
}


/// Error domain of a media error, used to classify it for the host.
#[derive( Debug, Clone, Copy, PartialEq, Eq )]
pub enum ErrorDomain {
    Core,
    Library,
    Resource,
    Stream,
}


impl ErrorDomain {
    pub fn as_str( &self ) -> &'static str {
        match self {
            ErrorDomain::Core => "core-error",
            ErrorDomain::Library => "library-error",
            ErrorDomain::Resource => "resource-error",
            ErrorDomain::Stream => "stream-error",
        }
    }
}


/// An error posted by the pipeline while it was running.
#[derive( Debug, Clone, PartialEq )]
pub struct MediaError {
    pub domain: ErrorDomain,
    pub code: i32,
    pub message: String,
}


impl MediaError {
    pub fn new( domain: ErrorDomain, code: i32, message: impl Into<String> ) -> Self {
        Self { domain, code, message: message.into() }
    }


    /// Structured details string handed to the host.
    pub fn details( &self ) -> String {
        format!( "{} (Domain: {}, Code: {})", self.message, self.domain.as_str(), self.code )
    }
}


/// Object that posted a bus message.
#[derive( Debug, Clone, PartialEq, Eq )]
pub enum MessageSource {
    /// The top-level pipeline element.
    Pipeline,
    /// An inner element, by name.
    Element( String ),
}


/// Messages posted on a pipeline's bus.
#[derive( Debug, Clone, PartialEq )]
pub enum BusMessage {
    Error { source: MessageSource, error: MediaError },
    StateChanged { source: MessageSource, old: PipelineState, new: PipelineState },
    Eos { source: MessageSource },
    DurationChanged { source: MessageSource },
    NewClock { source: MessageSource },
    AsyncDone { source: MessageSource },
    Buffering { source: MessageSource, percent: i32 },
    Tag { source: MessageSource, tags: Vec<( String, String )> },
}


impl BusMessage {
    pub fn source( &self ) -> &MessageSource {
        match self {
            BusMessage::Error { source, .. }
            | BusMessage::StateChanged { source, .. }
            | BusMessage::Eos { source }
            | BusMessage::DurationChanged { source }
            | BusMessage::NewClock { source }
            | BusMessage::AsyncDone { source }
            | BusMessage::Buffering { source, .. }
            | BusMessage::Tag { source, .. } => source,
        }
    }


    /// True when the top-level pipeline posted this message.
    pub fn from_pipeline( &self ) -> bool {
        *self.source() == MessageSource::Pipeline
    }
}


/// Items queued for a player thread.
pub(crate) enum LoopEvent {
    Message( BusMessage ),
    Quit,
}


/// Posting side of a pipeline's bus.
///
/// Clones share one attachment flag: once any clone is detached, all of them
/// silently drop further messages.
#[derive( Clone )]
pub struct Bus {
    tx: Sender<LoopEvent>,
    detached: Arc<AtomicBool>,
}


impl Bus {
    pub(crate) fn new( tx: Sender<LoopEvent> ) -> Self {
        Self {
            tx,
            detached: Arc::new( AtomicBool::new( false ) ),
        }
    }


    /// Posts a message. Returns false when the bus is detached or its loop is gone.
    pub fn post( &self, message: BusMessage ) -> bool {
        if self.detached.load( Ordering::Acquire ) {
            tracing::trace!( "Bus detached, dropping {:?}", message );
            return false;
        }
        self.tx.send( LoopEvent::Message( message ) ).is_ok()
    }


    /// Stops delivery of any further messages from every clone of this bus.
    pub fn detach( &self ) {
        self.detached.store( true, Ordering::Release );
    }


    pub fn is_detached( &self ) -> bool {
        self.detached.load( Ordering::Acquire )
    }
}


/// A seek or rate change request.
#[derive( Debug, Clone, Copy, PartialEq )]
pub struct SeekRequest {
    pub rate: f64,
    pub start: Duration,
    /// End of the segment; only bounded for reverse playback.
    pub stop: Option<Duration>,
    pub flush: bool,
    pub accurate: bool,
}


impl SeekRequest {
    /// Builds the request for `position_ms` at `rate`.
    ///
    /// Forward rates seek to the position with an open end; reverse rates play
    /// the segment from 0 up to the position backwards.
    pub fn new( position_ms: i64, rate: f64 ) -> Self {
        let position = Duration::from_millis( position_ms.max( 0 ) as u64 );
        if rate > 0.0 {
            Self { rate, start: position, stop: None, flush: true, accurate: true }
        } else {
            Self { rate, start: Duration::ZERO, stop: Some( position ), flush: true, accurate: true }
        }
    }


    pub fn is_reverse( &self ) -> bool {
        self.rate < 0.0
    }
}


/// Optional left/right balance stage of a pipeline.
pub trait BalanceStage: Send {
    /// Sets the panorama, -1.0 (left) to 1.0 (right).
    fn set_panorama( &mut self, panorama: f32 );
}


/// Control surface of one native playback pipeline.
pub trait Pipeline: Send {
    /// Sets the source URI used on the next transition out of NULL.
    fn set_uri( &mut self, uri: &str );

    /// Moves the pipeline towards `state`, posting a state-changed message per step.
    fn set_state( &mut self, state: PipelineState ) -> Result<StateChange, PipelineError>;

    /// Last state the pipeline reached.
    fn current_state( &self ) -> PipelineState;

    /// Blocks until pending transitions and seeks have settled.
    fn wait_settled( &mut self ) -> Result<PipelineState, PipelineError>;

    fn query_position( &self ) -> Option<Duration>;

    fn query_duration( &self ) -> Option<Duration>;

    /// Sends a seek event. Returns false when the pipeline rejected it outright.
    fn send_seek( &mut self, seek: SeekRequest ) -> bool;

    /// Sets the output volume, already clamped to [0, 1].
    fn set_volume( &mut self, volume: f64 );

    fn balance_stage( &mut self ) -> Option<&mut dyn BalanceStage>;

    /// Detaches the balance stage from the audio graph, if any.
    fn remove_balance_stage( &mut self );

    /// Stops posting bus messages.
    fn detach_bus( &mut self );
}


/// Builds pipelines on their player thread.
pub trait PipelineFactory: Send + Sync {
    fn build( &self, bus: Bus ) -> Result<Box<dyn Pipeline>, PipelineError>;
}


impl<F> PipelineFactory for F
where
    F: Fn( Bus ) -> Result<Box<dyn Pipeline>, PipelineError> + Send + Sync,
{
    fn build( &self, bus: Bus ) -> Result<Box<dyn Pipeline>, PipelineError> {
        self( bus )
    }
}


#[cfg( test )]
mod tests {
    use super::*;
    use std::sync::mpsc;


    #[test]
    fn test_state_ordering() {
        assert!( PipelineState::Null < PipelineState::Ready );
        assert!( PipelineState::Ready < PipelineState::Paused );
        assert!( PipelineState::Paused < PipelineState::Playing );
    }


    #[test]
    fn test_step_towards() {
        assert_eq!( PipelineState::Null.step_towards( PipelineState::Playing ), PipelineState::Ready );
        assert_eq!( PipelineState::Playing.step_towards( PipelineState::Null ), PipelineState::Paused );
        assert_eq!( PipelineState::Paused.step_towards( PipelineState::Paused ), PipelineState::Paused );
    }


    #[test]
    fn test_forward_seek_has_open_end() {
        let seek = SeekRequest::new( 5000, 1.5 );
        assert_eq!( seek.start, Duration::from_millis( 5000 ) );
        assert_eq!( seek.stop, None );
        assert!( seek.flush && seek.accurate );
        assert!( !seek.is_reverse() );
    }


    #[test]
    fn test_reverse_seek_is_bounded() {
        let seek = SeekRequest::new( 5000, -1.0 );
        assert_eq!( seek.start, Duration::ZERO );
        assert_eq!( seek.stop, Some( Duration::from_millis( 5000 ) ) );
        assert!( seek.is_reverse() );
    }


    #[test]
    fn test_media_error_details() {
        let error = MediaError::new( ErrorDomain::Stream, 4, "Could not determine type of stream" );
        assert_eq!(
            error.details(),
            "Could not determine type of stream (Domain: stream-error, Code: 4)"
        );
    }


    #[test]
    fn test_detached_bus_drops_messages() {
        let ( tx, rx ) = mpsc::channel();
        let bus = Bus::new( tx );
        let clone = bus.clone();

        assert!( clone.post( BusMessage::Eos { source: MessageSource::Pipeline } ) );
        bus.detach();
        assert!( !clone.post( BusMessage::Eos { source: MessageSource::Pipeline } ) );

        assert_eq!( rx.try_iter().count(), 1 );
    }
}
