//! Player registry
//!
//! Maps player ids to live players. Creation is idempotent; a disposed player
//! is removed and its id may be reused.
//!
//! Building a player blocks until its pipeline exists, so it happens outside
//! the map lock. An id being built is marked pending and concurrent creates of
//! the same id wait for it.

use std::collections::{ HashMap, HashSet };
use std::sync::{ Arc, Condvar, Mutex, MutexGuard, PoisonError };

use thiserror::Error;

use crate::event::EventSink;
use crate::pipeline::PipelineFactory;
use crate::player::{ AudioPlayer, PlayerError };


#[derive( Debug, Error )]
pub enum RegistryError {
    #[error( "Player has not yet been created or has already been disposed." )]
    NotFound( String ),

    #[error( "Failed to create player: {0}" )]
    Create( #[from] PlayerError ),
}


#[derive( Default )]
struct Players {
    live: HashMap<String, Arc<AudioPlayer>>,
    pending: HashSet<String>,
}


pub struct PlayerRegistry {
    players: Mutex<Players>,
    built: Condvar,
    factory: Arc<dyn PipelineFactory>,
    sink: Arc<dyn EventSink>,
}


impl PlayerRegistry {
    pub fn new( factory: Arc<dyn PipelineFactory>, sink: Arc<dyn EventSink> ) -> Self {
        Self {
            players: Mutex::new( Players::default() ),
            built: Condvar::new(),
            factory,
            sink,
        }
    }


    fn lock( &self ) -> MutexGuard<'_, Players> {
        self.players.lock().unwrap_or_else( PoisonError::into_inner )
    }


    /// Creates a player under `id`, or returns the existing one.
    pub fn create( &self, id: &str ) -> Result<Arc<AudioPlayer>, RegistryError> {
        let mut players = self.lock();
        loop {
            if let Some( player ) = players.live.get( id ) {
                tracing::debug!( "Player {} already exists", id );
                return Ok( Arc::clone( player ) );
            }
            if !players.pending.contains( id ) {
                break;
            }
            players = self.built.wait( players ).unwrap_or_else( PoisonError::into_inner );
        }
        players.pending.insert( id.to_string() );
        drop( players );

        let result = AudioPlayer::new( id, Arc::clone( &self.factory ), Arc::clone( &self.sink ) );

        let mut players = self.lock();
        players.pending.remove( id );
        if let Ok( player ) = result.as_ref() {
            players.live.insert( id.to_string(), Arc::clone( player ) );
        }
        drop( players );
        self.built.notify_all();
        Ok( result? )
    }


    pub fn get( &self, id: &str ) -> Result<Arc<AudioPlayer>, RegistryError> {
        self.lock()
            .live
            .get( id )
            .cloned()
            .ok_or_else( || RegistryError::NotFound( id.to_string() ) )
    }


    /// Forgets `id`. The player itself is not disposed.
    pub fn remove( &self, id: &str ) -> Option<Arc<AudioPlayer>> {
        self.lock().live.remove( id )
    }


    pub fn contains( &self, id: &str ) -> bool {
        self.lock().live.contains_key( id )
    }


    pub fn len( &self ) -> usize {
        self.lock().live.len()
    }


    pub fn is_empty( &self ) -> bool {
        self.lock().live.is_empty()
    }


    /// Disposes and removes every player.
    pub fn dispose_all( &self ) {
        let players: Vec<_> = self.lock().live.drain().collect();
        for ( id, player ) in players {
            if let Err( e ) = player.dispose() {
                tracing::warn!( "Disposing player {} failed: {}", id, e );
            }
        }
    }
}


impl Drop for PlayerRegistry {
    fn drop( &mut self ) {
        self.dispose_all();
    }
}


#[cfg( test )]
mod tests {
    use super::*;
    use std::sync::atomic::{ AtomicUsize, Ordering };
    use std::sync::mpsc;
    use crate::pipeline::{ Bus, Pipeline, PipelineError };
    use crate::testing::{ wait_until, MockFactory, RecordingSink };


    #[test]
    fn test_create_is_idempotent() {
        let factory = MockFactory::new();
        let registry = PlayerRegistry::new( factory.clone(), RecordingSink::new() );

        let first = registry.create( "p1" ).unwrap();
        let second = registry.create( "p1" ).unwrap();

        assert!( Arc::ptr_eq( &first, &second ) );
        assert_eq!( factory.built(), 1 );
        assert_eq!( registry.len(), 1 );
    }


    #[test]
    fn test_missing_player() {
        let registry = PlayerRegistry::new( MockFactory::new(), RecordingSink::new() );
        assert!( matches!( registry.get( "nope" ), Err( RegistryError::NotFound( _ ) ) ) );
    }


    #[test]
    fn test_id_reusable_after_remove() {
        let factory = MockFactory::new();
        let registry = PlayerRegistry::new( factory.clone(), RecordingSink::new() );

        let player = registry.create( "p1" ).unwrap();
        player.dispose().unwrap();
        registry.remove( "p1" );
        assert!( !registry.contains( "p1" ) );

        let again = registry.create( "p1" ).unwrap();
        assert!( !Arc::ptr_eq( &player, &again ) );
        assert!( !again.is_disposed() );
        assert_eq!( factory.built(), 2 );
    }


    #[test]
    fn test_failed_creation_registers_nothing() {
        let registry = PlayerRegistry::new( MockFactory::failing(), RecordingSink::new() );
        assert!( matches!( registry.create( "p1" ), Err( RegistryError::Create( _ ) ) ) );
        assert!( registry.is_empty() );
    }


    #[test]
    fn test_dispose_all() {
        let registry = PlayerRegistry::new( MockFactory::new(), RecordingSink::new() );
        let a = registry.create( "a" ).unwrap();
        let b = registry.create( "b" ).unwrap();

        registry.dispose_all();

        assert!( registry.is_empty() );
        assert!( a.is_disposed() );
        assert!( b.is_disposed() );
    }


    #[test]
    fn test_slow_creation_does_not_block_other_ids() {
        let mocks = MockFactory::new();
        let started = Arc::new( AtomicUsize::new( 0 ) );
        let ( release_tx, release_rx ) = mpsc::channel::<()>();
        let release_rx = Mutex::new( release_rx );

        let factory = {
            let mocks = Arc::clone( &mocks );
            let started = Arc::clone( &started );
            move |bus: Bus| -> Result<Box<dyn Pipeline>, PipelineError> {
                if started.fetch_add( 1, Ordering::SeqCst ) == 0 {
                    let _ = release_rx.lock().unwrap().recv();
                }
                mocks.build( bus )
            }
        };
        let registry = Arc::new( PlayerRegistry::new( Arc::new( factory ), RecordingSink::new() ) );

        let slow = {
            let registry = Arc::clone( &registry );
            std::thread::spawn( move || registry.create( "slow" ).unwrap() )
        };
        assert!( wait_until( || started.load( Ordering::SeqCst ) == 1 ) );

        registry.create( "fast" ).unwrap();
        assert!( registry.contains( "fast" ) );
        assert!( !registry.contains( "slow" ) );

        let again = {
            let registry = Arc::clone( &registry );
            std::thread::spawn( move || registry.create( "slow" ).unwrap() )
        };
        release_tx.send( () ).unwrap();

        let slow = slow.join().unwrap();
        let again = again.join().unwrap();
        assert!( Arc::ptr_eq( &slow, &again ) );
        assert_eq!( mocks.built(), 2 );
        assert_eq!( registry.len(), 2 );
    }
}
