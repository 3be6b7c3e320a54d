//! Server-side Lua procedures for the scripted strategy.
//!
//! Each attempt is a single atomic round trip. The stored value is the owner
//! identity; expiration is the key's native TTL, set with absolute
//! `PEXPIREAT` so every key of a multi-key lock expires at the same instant.
//! Scripts are invoked by SHA1 digest; a `NOSCRIPT` response reloads the
//! source and retries once, transparently to the caller.

/// Lua script for a non-blocking single-key lock attempt.
///
/// KEYS\[1\] = lock key
/// ARGV\[1\] = owner identity
/// ARGV\[2\] = absolute expiration in epoch milliseconds
///
/// Returns 1 if the key was newly set, 0 if some owner holds it.
pub const TRY_LOCK_SINGLE: &str = r"
if 1 == redis.call('SETNX', KEYS[1], ARGV[1]) then
    return redis.call('PEXPIREAT', KEYS[1], tonumber(ARGV[2]))
end
return 0
";

/// Lua script for a non-blocking multi-key lock attempt.
///
/// KEYS = lock keys
/// ARGV\[1\] = owner identity
/// ARGV\[2\] = absolute expiration in epoch milliseconds
///
/// Sets either every key or none. Returns 1 if all were newly set, 0 if any
/// key already existed.
pub const TRY_LOCK_MULTI: &str = r"
local args = {}
for i = 1, #KEYS do
    args[#args + 1] = KEYS[i]
    args[#args + 1] = ARGV[1]
end
if 1 == redis.call('MSETNX', unpack(args)) then
    local exp = tonumber(ARGV[2])
    for i = 1, #KEYS do
        redis.call('PEXPIREAT', KEYS[i], exp)
    end
    return 1
end
return 0
";

/// Lua script for one single-key acquisition attempt of the blocking loop.
///
/// KEYS\[1\] = lock key
/// ARGV\[1\] = owner identity
/// ARGV\[2\] = absolute expiration in epoch milliseconds
///
/// Returns `OK` if acquired, `DD` if the key is already held by this
/// identity (recursive deadlock), otherwise the key's remaining TTL in
/// milliseconds as the wait hint.
pub const LOCK_SINGLE: &str = r"
if 1 == redis.call('SETNX', KEYS[1], ARGV[1]) then
    redis.call('PEXPIREAT', KEYS[1], tonumber(ARGV[2]))
    return 'OK'
end
if ARGV[1] == redis.call('GET', KEYS[1]) then
    return 'DD'
end
return redis.call('PTTL', KEYS[1])
";

/// Lua script for one multi-key acquisition attempt of the blocking loop.
///
/// KEYS = lock keys
/// ARGV\[1\] = owner identity
/// ARGV\[2\] = absolute expiration in epoch milliseconds
///
/// Returns `OK` if every key was acquired, `DD` if any current holder is
/// this identity, otherwise the smallest remaining TTL in milliseconds
/// among the conflicting holders.
pub const LOCK_MULTI: &str = r"
local args = {}
for i = 1, #KEYS do
    args[#args + 1] = KEYS[i]
    args[#args + 1] = ARGV[1]
end
if 1 == redis.call('MSETNX', unpack(args)) then
    local exp = tonumber(ARGV[2])
    for i = 1, #KEYS do
        redis.call('PEXPIREAT', KEYS[i], exp)
    end
    return 'OK'
end
local owners = redis.call('MGET', unpack(KEYS))
for i = 1, #KEYS do
    if owners[i] == ARGV[1] then
        return 'DD'
    end
end
local wait = nil
for i = 1, #KEYS do
    local ttl = redis.call('PTTL', KEYS[i])
    if not wait or ttl < wait then
        wait = ttl
    end
end
return wait
";

/// Lua script for releasing a lock.
///
/// KEYS = lock keys
/// ARGV\[1\] = owner identity
///
/// Deletes every key iff all of them are still held by this identity;
/// otherwise deletes nothing. Returns the number of keys deleted.
pub const UNLOCK: &str = r"
local owners = redis.call('MGET', unpack(KEYS))
for i = 1, #KEYS do
    if owners[i] ~= ARGV[1] then
        return 0
    end
end
return redis.call('DEL', unpack(KEYS))
";

/// Lua script for extending a lock's TTL.
///
/// KEYS = lock keys
/// ARGV\[1\] = owner identity
/// ARGV\[2\] = new absolute expiration in epoch milliseconds
///
/// Returns 1 if this identity still held every key and all TTLs were moved.
/// A partially held set is deleted outright (partial ownership is not a
/// valid state) and 0 is returned.
pub const REFRESH: &str = r"
local owners = redis.call('MGET', unpack(KEYS))
local held = {}
for i = 1, #KEYS do
    if owners[i] == ARGV[1] then
        held[#held + 1] = KEYS[i]
    end
end
if #held == #KEYS then
    local exp = tonumber(ARGV[2])
    for i = 1, #KEYS do
        if 0 == redis.call('PEXPIREAT', KEYS[i], exp) then
            redis.call('DEL', unpack(held))
            return 0
        end
    end
    return 1
elseif #held > 0 then
    redis.call('DEL', unpack(held))
end
return 0
";

/// Lua script reporting whether any of the keys is currently held.
///
/// KEYS = lock keys
///
/// Returns 1 if at least one key exists, 0 otherwise.
pub const IS_LOCKED: &str = r"
for i = 1, #KEYS do
    if 1 == redis.call('EXISTS', KEYS[i]) then
        return 1
    end
end
return 0
";
