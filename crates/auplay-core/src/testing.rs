//! Scripted pipeline and recording sink shared by the unit tests.

use std::sync::mpsc::{ self, Receiver };
use std::sync::{ Arc, Condvar, Mutex, MutexGuard, PoisonError };
use std::time::{ Duration, Instant };

use crate::event::{ EventSink, PlayerEvent };
use crate::pipeline::{
    BalanceStage, Bus, BusMessage, LoopEvent, MessageSource, Pipeline, PipelineError,
    PipelineFactory, PipelineState, SeekRequest, StateChange,
};


pub const WAIT: Duration = Duration::from_secs( 5 );


fn lock<T>( mutex: &Mutex<T> ) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else( PoisonError::into_inner )
}


/// Every call a [`MockPipeline`] received, in order.
#[derive( Debug, Clone, PartialEq )]
pub enum Call {
    SetUri( String ),
    SetState( PipelineState ),
    WaitSettled,
    Seek( SeekRequest ),
    Volume( f64 ),
    Balance( f32 ),
    DetachBus,
    RemoveBalanceStage,
    Dropped,
}


#[derive( Default )]
struct Script {
    fail_states: Vec<PipelineState>,
    fail_seek: bool,
    settle_preroll: bool,
    position: Option<Duration>,
    duration: Option<Duration>,
}


/// Shared view of one mock pipeline: its call log, its script and its bus.
pub struct MockControl {
    calls: Mutex<Vec<Call>>,
    script: Mutex<Script>,
    bus: Mutex<Option<Bus>>,
    // Keeps standalone buses connected
    sink: Mutex<Option<Receiver<LoopEvent>>>,
}


impl MockControl {
    fn new() -> Arc<Self> {
        Arc::new( Self {
            calls: Mutex::new( Vec::new() ),
            script: Mutex::new( Script::default() ),
            bus: Mutex::new( None ),
            sink: Mutex::new( None ),
        })
    }


    /// A mock pipeline not attached to any player thread.
    pub fn standalone( balance: bool ) -> ( Box<dyn Pipeline>, Arc<MockControl> ) {
        let control = Self::new();
        let ( tx, rx ) = mpsc::channel();
        *lock( &control.sink ) = Some( rx );
        let pipeline = MockPipeline::new( Bus::new( tx ), Arc::clone( &control ), balance );
        ( Box::new( pipeline ), control )
    }


    pub fn calls( &self ) -> Vec<Call> {
        lock( &self.calls ).clone()
    }


    pub fn seeks( &self ) -> Vec<SeekRequest> {
        self.calls()
            .into_iter()
            .filter_map( |c| match c {
                Call::Seek( seek ) => Some( seek ),
                _ => None,
            })
            .collect()
    }


    pub fn last_state_request( &self ) -> Option<PipelineState> {
        self.calls().into_iter().rev().find_map( |c| match c {
            Call::SetState( state ) => Some( state ),
            _ => None,
        })
    }


    pub fn fail_state( &self, state: PipelineState ) {
        lock( &self.script ).fail_states.push( state );
    }


    pub fn fail_seek( &self, fail: bool ) {
        lock( &self.script ).fail_seek = fail;
    }


    /// Posts AsyncDone ahead of the READY to PAUSED state change.
    pub fn settle_preroll( &self, settle: bool ) {
        lock( &self.script ).settle_preroll = settle;
    }


    pub fn set_position( &self, position: Option<Duration> ) {
        lock( &self.script ).position = position;
    }


    pub fn set_duration( &self, duration: Option<Duration> ) {
        lock( &self.script ).duration = duration;
    }


    /// Posts a message as if the pipeline had.
    pub fn post( &self, message: BusMessage ) {
        if let Some( bus ) = lock( &self.bus ).as_ref() {
            bus.post( message );
        }
    }


    pub fn post_async_done( &self ) {
        self.post( BusMessage::AsyncDone { source: MessageSource::Pipeline } );
    }


    pub fn post_eos( &self ) {
        self.post( BusMessage::Eos { source: MessageSource::Pipeline } );
    }


    fn record( &self, call: Call ) {
        lock( &self.calls ).push( call );
    }
}


struct MockBalance {
    control: Arc<MockControl>,
}


impl BalanceStage for MockBalance {
    fn set_panorama( &mut self, panorama: f32 ) {
        self.control.record( Call::Balance( panorama ) );
    }
}


/// Pipeline that follows state requests synchronously and posts a
/// state-changed message per step. Seeks complete only when a test posts
/// AsyncDone through its [`MockControl`].
pub struct MockPipeline {
    bus: Bus,
    control: Arc<MockControl>,
    state: PipelineState,
    balance: Option<MockBalance>,
}


impl MockPipeline {
    fn new( bus: Bus, control: Arc<MockControl>, balance: bool ) -> Self {
        *lock( &control.bus ) = Some( bus.clone() );
        let balance = balance.then( || MockBalance { control: Arc::clone( &control ) } );
        Self { bus, control, state: PipelineState::Null, balance }
    }
}


impl Pipeline for MockPipeline {
    fn set_uri( &mut self, uri: &str ) {
        self.control.record( Call::SetUri( uri.to_string() ) );
    }


    fn set_state( &mut self, state: PipelineState ) -> Result<StateChange, PipelineError> {
        self.control.record( Call::SetState( state ) );
        let settle_preroll = {
            let script = lock( &self.control.script );
            if script.fail_states.contains( &state ) {
                return Err( PipelineError::StateChange( state ) );
            }
            script.settle_preroll
        };
        while self.state != state {
            let next = self.state.step_towards( state );
            if settle_preroll && self.state == PipelineState::Ready && next == PipelineState::Paused {
                self.bus.post( BusMessage::AsyncDone { source: MessageSource::Pipeline } );
            }
            self.bus.post( BusMessage::StateChanged {
                source: MessageSource::Pipeline,
                old: self.state,
                new: next,
            });
            self.state = next;
        }
        Ok( StateChange::Success )
    }


    fn current_state( &self ) -> PipelineState {
        self.state
    }


    fn wait_settled( &mut self ) -> Result<PipelineState, PipelineError> {
        self.control.record( Call::WaitSettled );
        Ok( self.state )
    }


    fn query_position( &self ) -> Option<Duration> {
        lock( &self.control.script ).position
    }


    fn query_duration( &self ) -> Option<Duration> {
        lock( &self.control.script ).duration
    }


    fn send_seek( &mut self, seek: SeekRequest ) -> bool {
        self.control.record( Call::Seek( seek ) );
        !lock( &self.control.script ).fail_seek
    }


    fn set_volume( &mut self, volume: f64 ) {
        self.control.record( Call::Volume( volume ) );
    }


    fn balance_stage( &mut self ) -> Option<&mut dyn BalanceStage> {
        self.balance.as_mut().map( |b| b as &mut dyn BalanceStage )
    }


    fn remove_balance_stage( &mut self ) {
        self.control.record( Call::RemoveBalanceStage );
        self.balance = None;
    }


    fn detach_bus( &mut self ) {
        self.control.record( Call::DetachBus );
        self.bus.detach();
    }
}


impl Drop for MockPipeline {
    fn drop( &mut self ) {
        self.control.record( Call::Dropped );
    }
}


/// Factory handing out mock pipelines and keeping their controls.
pub struct MockFactory {
    controls: Mutex<Vec<Arc<MockControl>>>,
    balance: bool,
    fail: bool,
}


impl MockFactory {
    pub fn new() -> Arc<Self> {
        Arc::new( Self { controls: Mutex::new( Vec::new() ), balance: true, fail: false } )
    }


    pub fn without_balance() -> Arc<Self> {
        Arc::new( Self { controls: Mutex::new( Vec::new() ), balance: false, fail: false } )
    }


    pub fn failing() -> Arc<Self> {
        Arc::new( Self { controls: Mutex::new( Vec::new() ), balance: true, fail: true } )
    }


    pub fn built( &self ) -> usize {
        lock( &self.controls ).len()
    }


    pub fn last( &self ) -> Arc<MockControl> {
        lock( &self.controls ).last().cloned().expect( "no pipeline built" )
    }
}


impl PipelineFactory for MockFactory {
    fn build( &self, bus: Bus ) -> Result<Box<dyn Pipeline>, PipelineError> {
        if self.fail {
            return Err( PipelineError::ElementCreation( "playbin".into() ) );
        }
        let control = MockControl::new();
        lock( &self.controls ).push( Arc::clone( &control ) );
        Ok( Box::new( MockPipeline::new( bus, control, self.balance ) ) )
    }
}


/// Sink that records events and lets tests wait for them.
#[derive( Default )]
pub struct RecordingSink {
    events: Mutex<Vec<( String, PlayerEvent )>>,
    changed: Condvar,
}


impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new( Self::default() )
    }


    pub fn events( &self ) -> Vec<( String, PlayerEvent )> {
        lock( &self.events ).clone()
    }


    pub fn count( &self, predicate: impl Fn( &PlayerEvent ) -> bool ) -> usize {
        lock( &self.events ).iter().filter( |( _, e )| predicate( e ) ).count()
    }


    /// Waits until at least `n` recorded events match.
    pub fn wait_for_count( &self, n: usize, predicate: impl Fn( &PlayerEvent ) -> bool ) -> bool {
        let deadline = Instant::now() + WAIT;
        let mut events = lock( &self.events );
        loop {
            if events.iter().filter( |( _, e )| predicate( e ) ).count() >= n {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            events = self.changed
                .wait_timeout( events, deadline - now )
                .unwrap_or_else( PoisonError::into_inner )
                .0;
        }
    }


    pub fn wait_for( &self, predicate: impl Fn( &PlayerEvent ) -> bool ) -> bool {
        self.wait_for_count( 1, predicate )
    }
}


impl EventSink for RecordingSink {
    fn emit( &self, channel: &str, event: &PlayerEvent ) {
        lock( &self.events ).push(( channel.to_string(), event.clone() ));
        self.changed.notify_all();
    }
}


/// Blocks until `condition` holds or the wait times out.
pub fn wait_until( condition: impl Fn() -> bool ) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep( Duration::from_millis( 2 ) );
    }
    condition()
}


/// Writes a mono 16-bit PCM WAV file of `frames` frames to the temp dir.
pub fn write_test_wav( name: &str, sample_rate: u32, frames: u32 ) -> std::path::PathBuf {
    let path = std::env::temp_dir().join( format!( "auplay-{}-{}.wav", name, std::process::id() ) );
    let data_len = frames * 2;

    let mut bytes = Vec::with_capacity( 44 + data_len as usize );
    bytes.extend_from_slice( b"RIFF" );
    bytes.extend_from_slice( &( 36 + data_len ).to_le_bytes() );
    bytes.extend_from_slice( b"WAVEfmt " );
    bytes.extend_from_slice( &16_u32.to_le_bytes() );
    bytes.extend_from_slice( &1_u16.to_le_bytes() );
    bytes.extend_from_slice( &1_u16.to_le_bytes() );
    bytes.extend_from_slice( &sample_rate.to_le_bytes() );
    bytes.extend_from_slice( &( sample_rate * 2 ).to_le_bytes() );
    bytes.extend_from_slice( &2_u16.to_le_bytes() );
    bytes.extend_from_slice( &16_u16.to_le_bytes() );
    bytes.extend_from_slice( b"data" );
    bytes.extend_from_slice( &data_len.to_le_bytes() );
    for i in 0..frames {
        let sample = ( ( i % 100 ) as i16 - 50 ) * 300;
        bytes.extend_from_slice( &sample.to_le_bytes() );
    }

    std::fs::write( &path, bytes ).expect( "write test wav" );
    path
}
